//! Simulated ECU for exercising the flash workflows without hardware
//!
//! [SimulatedEcu] is a [FrameChannel] with an ECU on the other end. It reassembles
//! segmented requests (answering first frames with flow control), replies with segmented
//! responses (waiting for our flow control unless the auto flow control quirk is set), and
//! models the application, security access, bootloader upload, erase, programming, digest and
//! memory read services of a flash bootloader.
//!
//! Faults can be injected to drive the workflows' error handling, and every frame and request
//! received is recorded for inspection.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use crate::{
    channel::{
        AdapterCapabilities, AdapterQuirks, CanFrame, ChannelError, ChannelResult, FrameCallback,
        FrameChannel,
    },
    firmware::{code_block, partition_table, EcuFamily, EcuVariant, Partition},
    flash::PROBE_DID,
    kwp2000::SecurityLevel,
    segmented::{
        consecutive_frames, first_frame, single_frame, FlowControl, Reassembler, ReassemblyStep,
        SINGLE_FRAME_MAX,
    },
};

const FLASH_SIZE: usize = 0x240000;
const BLOCK_CODED_END: usize = 0x100000;
const MAX_KEY_FAILURES: u32 = 3;

/// Sample key derivation the simulated ECU expects
pub fn sample_key(seed: [u8; 2], level: SecurityLevel) -> [u8; 2] {
    let l = level.seed_request().unwrap_or(0) as u16;
    (u16::from_be_bytes(seed).rotate_left(3) ^ (l * 0x0101)).to_be_bytes()
}

/// Sample 16 byte digest the simulated ECU computes for partitions
pub fn sample_digest(data: &[u8]) -> [u8; 16] {
    let mut d = [0u8; 16];
    for (i, b) in data.iter().enumerate() {
        let slot = &mut d[i % 16];
        *slot = slot.wrapping_mul(31).wrapping_add(*b);
    }
    d
}

/// Scripted behaviour of the erase routines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EraseScript {
    /// 'Response pending' replies sent before the erase completes
    pub pending: u32,
    /// Erase requests answered with 'busy, repeat request' first
    pub busy: u32,
    /// Negative response code which refuses every erase
    pub refuse: Option<u8>,
}

/// Replies the ECU sends before it answers one service normally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyScript {
    /// Service the script applies to
    pub sid: u8,
    /// Requests answered with 'busy, repeat request' first
    pub busy: u32,
    /// 'Response pending' replies sent before the answer
    pub pending: u32,
    /// Replies to some other service sent before the answer
    pub unrelated: u32,
    /// Leave the answer out, for the test to deliver with [SimulatedEcu::inject_response]
    pub withhold_answer: bool,
}

#[derive(Debug, Clone, Copy)]
struct Download {
    address: u32,
    len: u32,
    to_ram: bool,
}

#[derive(Debug)]
struct EcuState {
    variant: EcuVariant,
    session: u8,
    comm_disabled: bool,
    bootloader_running: bool,
    granted: Option<SecurityLevel>,
    preset_grants: Vec<SecurityLevel>,
    pending_seed: Option<SecurityLevel>,
    seed: [u8; 2],
    key_failures: u32,
    download: Option<Download>,
    ram_loaded: u32,
    flash: Vec<u8>,
    dids: HashMap<u8, Vec<u8>>,
    rx: Reassembler,
    pending_cfs: VecDeque<[u8; 8]>,
    frames: Vec<CanFrame>,
    requests: Vec<Vec<u8>>,
    resets: u32,
    erase: EraseScript,
    busy_left: u32,
    nak: Option<(u32, u32)>,
    fail_write: Option<u32>,
    corrupt_sequence: bool,
    zeroed_before_response: bool,
    transfer_delay: Option<Duration>,
    flow_control: Vec<[u8; 8]>,
    replies: Option<ReplyScript>,
}

impl EcuState {
    fn new(variant: EcuVariant) -> Self {
        Self {
            variant,
            session: 0x81,
            comm_disabled: false,
            bootloader_running: false,
            granted: None,
            preset_grants: Vec::new(),
            pending_seed: None,
            seed: [0x12, 0x34],
            key_failures: 0,
            download: None,
            ram_loaded: 0,
            flash: vec![0xFF; FLASH_SIZE],
            dids: HashMap::new(),
            rx: Reassembler::new(),
            pending_cfs: VecDeque::new(),
            frames: Vec::new(),
            requests: Vec::new(),
            resets: 0,
            erase: EraseScript::default(),
            busy_left: 0,
            nak: None,
            fail_write: None,
            corrupt_sequence: false,
            zeroed_before_response: false,
            transfer_delay: None,
            flow_control: Vec::new(),
            replies: None,
        }
    }

    fn reset(&mut self) {
        self.session = 0x81;
        self.comm_disabled = false;
        self.bootloader_running = false;
        self.granted = None;
        self.pending_seed = None;
        self.key_failures = 0;
        self.download = None;
        self.ram_loaded = 0;
        self.resets += 1;
    }

    fn bootloader_authenticated(&self) -> bool {
        self.bootloader_running
            && matches!(self.granted, Some(SecurityLevel::LevelFB | SecurityLevel::LevelFD))
    }

    fn partitions(&self) -> &'static [Partition] {
        partition_table(self.variant).unwrap_or(&[])
    }

    /// Handles one frame from the tester, returning the frames to send back
    fn on_frame(&mut self, data: &[u8], auto_flow: bool) -> (Vec<[u8; 8]>, Option<Duration>) {
        if data.first().is_some_and(|b| b >> 4 == 0x3) {
            return (self.pending_cfs.drain(..).collect(), None);
        }
        match self.rx.push(data) {
            Ok(ReassemblyStep::FirstFrame) if self.flow_control.is_empty() => {
                (vec![FlowControl::clear_to_send()], None)
            }
            Ok(ReassemblyStep::FirstFrame) => (std::mem::take(&mut self.flow_control), None),
            Ok(ReassemblyStep::Complete(req)) => {
                self.requests.push(req.clone());
                let delay = if req.first() == Some(&0x36) {
                    self.transfer_delay
                } else {
                    None
                };
                let responses = self.handle_scripted(&req);
                (self.encode(responses, auto_flow), delay)
            }
            Ok(_) => (Vec::new(), None),
            Err(e) => {
                log::warn!("Simulated ECU dropped request: {e}");
                self.rx.reset();
                (Vec::new(), None)
            }
        }
    }

    fn encode(&mut self, responses: Vec<Vec<u8>>, auto_flow: bool) -> Vec<[u8; 8]> {
        let mut out = Vec::new();
        for resp in responses.into_iter().filter(|r| !r.is_empty()) {
            if self.zeroed_before_response {
                out.push([0u8; 8]);
            }
            if resp.len() <= SINGLE_FRAME_MAX {
                if let Ok(f) = single_frame(&resp) {
                    out.push(f);
                }
                continue;
            }
            let Ok(ff) = first_frame(&resp) else {
                continue;
            };
            out.push(ff);
            let mut cfs: Vec<[u8; 8]> = consecutive_frames(&resp).collect();
            if self.corrupt_sequence && cfs.len() > 1 {
                self.corrupt_sequence = false;
                cfs[1][0] = 0x2F;
                log::debug!("Simulated ECU corrupting sequence counter of {resp:02X?}");
            }
            if auto_flow {
                out.extend(cfs);
            } else {
                self.pending_cfs.extend(cfs);
            }
        }
        out
    }

    fn handle_scripted(&mut self, req: &[u8]) -> Vec<Vec<u8>> {
        let sid = req[0];
        let Some(script) = self.replies.as_mut().filter(|s| s.sid == sid) else {
            return self.handle(req);
        };
        if script.busy > 0 {
            script.busy -= 1;
            return vec![vec![0x7F, sid, 0x21]];
        }
        let ReplyScript {
            unrelated,
            pending,
            withhold_answer,
            ..
        } = *script;
        self.replies = None;
        let mut out = vec![vec![0x7E, 0x01]; unrelated as usize];
        out.extend(vec![vec![0x7F, sid, 0x78]; pending as usize]);
        let answer = self.handle(req);
        if !withhold_answer {
            out.extend(answer);
        }
        out
    }

    fn handle(&mut self, req: &[u8]) -> Vec<Vec<u8>> {
        let sid = req[0];
        let neg = |code: u8| vec![vec![0x7F, sid, code]];
        match sid {
            0x10 => match req.get(1) {
                Some(mode) => {
                    self.session = *mode;
                    vec![vec![0x50, *mode]]
                }
                None => neg(0x12),
            },
            0x11 => {
                self.reset();
                vec![vec![0x51, req.get(1).copied().unwrap_or(0x01)]]
            }
            0x1A => self.read_identification(req),
            0x3B => match req.get(1) {
                Some(id) if !self.bootloader_running => {
                    self.dids.insert(*id, req[2..].to_vec());
                    vec![vec![0x7B, *id]]
                }
                Some(_) => neg(0x22),
                None => neg(0x12),
            },
            0x28 => {
                if self.session != 0x92 {
                    return neg(0x22);
                }
                self.comm_disabled = true;
                vec![vec![0x68]]
            }
            0x27 => self.security_access(req),
            0x34 => self.request_download(req),
            0x36 => self.transfer_data(req),
            0x37 => {
                self.download = None;
                vec![vec![0x77]]
            }
            0x31 => self.routine(req),
            0x23 => self.read_memory(req),
            0x3E => {
                if req.get(1) == Some(&0x02) {
                    Vec::new()
                } else {
                    vec![vec![0x7E, 0x01]]
                }
            }
            _ => neg(0x11),
        }
    }

    fn read_identification(&mut self, req: &[u8]) -> Vec<Vec<u8>> {
        let Some(id) = req.get(1).copied() else {
            return vec![vec![0x7F, 0x1A, 0x12]];
        };
        let data = if self.bootloader_running {
            (id == PROBE_DID).then(|| b"BOOT".to_vec())
        } else {
            self.dids.get(&id).cloned()
        };
        match data {
            Some(d) => {
                let mut r = vec![0x5A, id];
                r.extend_from_slice(&d);
                vec![r]
            }
            None => vec![vec![0x7F, 0x1A, 0x31]],
        }
    }

    fn security_access(&mut self, req: &[u8]) -> Vec<Vec<u8>> {
        let neg = |code: u8| vec![vec![0x7F, 0x27, code]];
        let Some(sub) = req.get(1).copied() else {
            return neg(0x12);
        };
        let level_for = |b: u8| match b {
            0x01 => Some(SecurityLevel::Level01),
            0xFB => Some(SecurityLevel::LevelFB),
            0xFD => Some(SecurityLevel::LevelFD),
            _ => None,
        };
        if self.key_failures >= MAX_KEY_FAILURES {
            return neg(0x36);
        }
        if sub % 2 == 1 {
            let Some(level) = level_for(sub) else {
                return neg(0x12);
            };
            let allowed = match level {
                SecurityLevel::Level01 => !self.bootloader_running && self.session == 0x92,
                _ => self.bootloader_running,
            };
            if !allowed {
                return neg(0x22);
            }
            if self.granted == Some(level) || self.preset_grants.contains(&level) {
                self.granted = Some(level);
                return vec![vec![0x67, sub, 0x00, 0x00]];
            }
            self.granted = None;
            self.pending_seed = Some(level);
            vec![vec![0x67, sub, self.seed[0], self.seed[1]]]
        } else {
            let Some(level) = level_for(sub.wrapping_sub(1)) else {
                return neg(0x12);
            };
            if self.pending_seed != Some(level) || req.len() < 4 {
                return neg(0x22);
            }
            self.pending_seed = None;
            if req[2..4] != sample_key(self.seed, level) {
                self.key_failures += 1;
                return if self.key_failures >= MAX_KEY_FAILURES {
                    neg(0x36)
                } else {
                    neg(0x35)
                };
            }
            self.granted = Some(level);
            vec![vec![0x67, sub, 0x34]]
        }
    }

    fn request_download(&mut self, req: &[u8]) -> Vec<Vec<u8>> {
        let neg = |code: u8| vec![vec![0x7F, 0x34, code]];
        if req.len() != 8 {
            return neg(0x12);
        }
        let address = u32::from_be_bytes([0, req[2], req[3], req[4]]);
        let len = u32::from_be_bytes([0, req[5], req[6], req[7]]);
        let to_ram = !self.bootloader_running;
        let allowed = if to_ram {
            self.comm_disabled && self.granted == Some(SecurityLevel::Level01)
        } else {
            self.bootloader_authenticated()
        };
        if !allowed {
            return neg(0x33);
        }
        if to_ram {
            self.ram_loaded = 0;
        }
        self.download = Some(Download { address, len, to_ram });
        vec![vec![0x74]]
    }

    fn transfer_data(&mut self, req: &[u8]) -> Vec<Vec<u8>> {
        let neg = |code: u8| vec![vec![0x7F, 0x36, code]];
        if req.len() < 6 {
            return neg(0x12);
        }
        let Some(dl) = self.download else {
            return neg(0x22);
        };
        let address = u32::from_be_bytes([req[2], req[3], req[4], req[5]]);
        let data = &req[6..];
        match req[1] {
            0x80 => {
                if dl.to_ram && address == dl.address && self.ram_loaded >= dl.len {
                    self.bootloader_running = true;
                    self.granted = None;
                    self.pending_seed = None;
                    self.download = None;
                    vec![vec![0x76]]
                } else {
                    neg(0x22)
                }
            }
            0x00 => {
                if address < dl.address || address + data.len() as u32 > dl.address + dl.len {
                    return neg(0x31);
                }
                if let Some((a, left)) = self.nak.as_mut() {
                    if *a == address && *left > 0 {
                        *left -= 1;
                        return neg(0x72);
                    }
                }
                if dl.to_ram {
                    self.ram_loaded += data.len() as u32;
                    return vec![vec![0x76]];
                }
                let plain = if self.variant.family() == EcuFamily::BlockCoded
                    && (address as usize) < BLOCK_CODED_END
                {
                    code_block(data)
                } else {
                    data.to_vec()
                };
                for (i, b) in plain.into_iter().enumerate() {
                    let at = address + i as u32;
                    if self.fail_write == Some(at) {
                        continue;
                    }
                    if let Some(slot) = self.flash.get_mut(at as usize) {
                        *slot = b;
                    }
                }
                vec![vec![0x76]]
            }
            _ => neg(0x12),
        }
    }

    fn routine(&mut self, req: &[u8]) -> Vec<Vec<u8>> {
        let neg = |code: u8| vec![vec![0x7F, 0x31, code]];
        let Some(sub) = req.get(1).copied() else {
            return neg(0x12);
        };
        if !self.bootloader_authenticated() {
            return neg(0x33);
        }
        match sub {
            0x52 | 0x53 => {
                let range = if sub == 0x52 {
                    0x020000..BLOCK_CODED_END
                } else {
                    match req.get(2).and_then(|i| self.partitions().get(*i as usize)) {
                        Some(p) => p.phys_start as usize..p.phys_end as usize,
                        None => return neg(0x31),
                    }
                };
                if self.busy_left > 0 {
                    self.busy_left -= 1;
                    return neg(0x21);
                }
                if let Some(code) = self.erase.refuse {
                    return neg(code);
                }
                self.flash[range].fill(0xFF);
                let mut out = vec![vec![0x7F, 0x31, 0x78]; self.erase.pending as usize];
                out.push(vec![0x71, sub]);
                out
            }
            0x54 => match req.get(2).and_then(|i| self.partitions().get(*i as usize)) {
                Some(p) => {
                    let mut r = vec![0x71, 0x54, p.index];
                    r.extend_from_slice(&sample_digest(
                        &self.flash[p.phys_start as usize..p.phys_end as usize],
                    ));
                    vec![r]
                }
                None => neg(0x31),
            },
            _ => neg(0x12),
        }
    }

    fn read_memory(&mut self, req: &[u8]) -> Vec<Vec<u8>> {
        let neg = |code: u8| vec![vec![0x7F, 0x23, code]];
        if req.len() != 5 {
            return neg(0x12);
        }
        if !self.bootloader_authenticated() {
            return neg(0x33);
        }
        let address = u32::from_be_bytes([0, req[1], req[2], req[3]]) as usize;
        let len = req[4] as usize;
        match self.flash.get(address..address + len) {
            Some(d) => {
                let mut r = vec![0x63];
                r.extend_from_slice(d);
                vec![r]
            }
            None => neg(0x31),
        }
    }
}

/// In-process ECU reachable through [FrameChannel]
pub struct SimulatedEcu {
    request_id: u32,
    response_id: u32,
    quirks: AdapterQuirks,
    open: AtomicBool,
    state: Mutex<EcuState>,
    callback: Mutex<Option<FrameCallback>>,
    allowed: Mutex<Vec<u32>>,
}

impl std::fmt::Debug for SimulatedEcu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedEcu")
            .field("request_id", &format_args!("0x{:03X}", self.request_id))
            .field("response_id", &format_args!("0x{:03X}", self.response_id))
            .field("quirks", &self.quirks)
            .finish_non_exhaustive()
    }
}

fn poisoned<T>(_: T) -> ChannelError {
    ChannelError::Other("Simulated ECU lock poisoned".into())
}

impl SimulatedEcu {
    /// Creates an ECU of `variant` answering 0x7E0 on 0x7E8, running its application
    pub fn new(variant: EcuVariant) -> Self {
        Self::with_ids(variant, 0x7E0, 0x7E8)
    }

    /// Creates an ECU with custom request and response identifiers
    pub fn with_ids(variant: EcuVariant, request_id: u32, response_id: u32) -> Self {
        Self {
            request_id,
            response_id,
            quirks: AdapterQuirks::empty(),
            open: AtomicBool::new(false),
            state: Mutex::new(EcuState::new(variant)),
            callback: Mutex::new(None),
            allowed: Mutex::new(Vec::new()),
        }
    }

    /// Pretends to be an adapter with the given quirks
    pub fn with_quirks(mut self, quirks: AdapterQuirks) -> Self {
        self.quirks = quirks;
        self
    }

    fn lock(&self) -> ChannelResult<MutexGuard<'_, EcuState>> {
        self.state.lock().map_err(poisoned)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut EcuState) -> T) -> Option<T> {
        match self.lock() {
            Ok(mut s) => Some(f(&mut s)),
            Err(e) => {
                log::error!("{e}");
                None
            }
        }
    }

    /// Puts the ECU in its bootloader, as left by an interrupted flash
    pub fn set_bootloader_running(&self, running: bool) {
        self.with_state(|s| s.bootloader_running = running);
    }

    /// Makes the ECU report `level` as already unlocked (seed 0x0000)
    pub fn grant_without_key(&self, level: SecurityLevel) {
        self.with_state(|s| s.preset_grants.push(level));
    }

    /// Sets the seed handed out by the ECU
    pub fn set_seed(&self, seed: [u8; 2]) {
        self.with_state(|s| s.seed = seed);
    }

    /// Stores an identification record
    pub fn set_did(&self, id: u8, data: &[u8]) {
        self.with_state(|s| s.dids.insert(id, data.to_vec()));
    }

    /// Reads an identification record
    pub fn did(&self, id: u8) -> Option<Vec<u8>> {
        self.with_state(|s| s.dids.get(&id).cloned()).flatten()
    }

    /// Scripts the erase routines
    pub fn set_erase_script(&self, script: EraseScript) {
        self.with_state(|s| {
            s.erase = script;
            s.busy_left = script.busy;
        });
    }

    /// Refuses the next `times` transfers to `address` with 'general programming failure'
    pub fn nak_transfers_at(&self, address: u32, times: u32) {
        self.with_state(|s| s.nak = Some((address, times)));
    }

    /// Silently drops writes to the flash byte at `address`
    pub fn fail_write_at(&self, address: u32) {
        self.with_state(|s| s.fail_write = Some(address));
    }

    /// Sends the next segmented response with a bad sequence counter
    pub fn corrupt_next_response_sequence(&self) {
        self.with_state(|s| s.corrupt_sequence = true);
    }

    /// Precedes every response with an all zero frame
    pub fn send_zeroed_frames(&self, enable: bool) {
        self.with_state(|s| s.zeroed_before_response = enable);
    }

    /// Removes every injected fault
    pub fn clear_faults(&self) {
        self.with_state(|s| {
            s.erase = EraseScript::default();
            s.busy_left = 0;
            s.nak = None;
            s.fail_write = None;
            s.corrupt_sequence = false;
            s.zeroed_before_response = false;
            s.transfer_delay = None;
            s.flow_control.clear();
            s.replies = None;
        });
    }

    /// Answers the next first frame with `frames` instead of a plain 'clear to send'
    pub fn script_flow_control(&self, frames: &[[u8; 8]]) {
        self.with_state(|s| s.flow_control = frames.to_vec());
    }

    /// Scripts the replies to the next request for `script.sid`
    pub fn script_replies(&self, script: ReplyScript) {
        self.with_state(|s| s.replies = Some(script));
    }

    /// Sends a single frame response outside of any request
    pub fn inject_response(&self, payload: &[u8]) -> ChannelResult<()> {
        let frame = single_frame(payload).map_err(|e| ChannelError::Other(e.to_string()))?;
        self.deliver(vec![frame])
    }

    /// Delays every transfer data response
    pub fn set_transfer_delay(&self, delay: Duration) {
        self.with_state(|s| s.transfer_delay = Some(delay));
    }

    /// Loads an image into flash, as if previously programmed
    pub fn load_image(&self, image: &[u8]) {
        self.with_state(|s| match s.variant.family() {
            EcuFamily::BlockCoded => {
                let n = image.len().min(FLASH_SIZE);
                s.flash[..n].copy_from_slice(&image[..n]);
            }
            EcuFamily::Partitioned => {
                for p in s.partitions() {
                    if let Some(src) = image.get(p.file_start as usize..p.file_end as usize) {
                        s.flash[p.phys_start as usize..p.phys_end as usize].copy_from_slice(src);
                    }
                }
            }
        });
    }

    /// Copy of flash memory from `address`
    pub fn flash(&self, address: u32, len: usize) -> Vec<u8> {
        self.with_state(|s| {
            s.flash
                .get(address as usize..address as usize + len)
                .map(|d| d.to_vec())
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }

    /// True while the bootloader runs
    pub fn bootloader_running(&self) -> bool {
        self.with_state(|s| s.bootloader_running).unwrap_or(false)
    }

    /// Security level currently granted
    pub fn granted(&self) -> Option<SecurityLevel> {
        self.with_state(|s| s.granted).flatten()
    }

    /// Number of ECU resets received
    pub fn resets(&self) -> u32 {
        self.with_state(|s| s.resets).unwrap_or(0)
    }

    /// Every complete request received, in order
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.with_state(|s| s.requests.clone()).unwrap_or_default()
    }

    /// Every frame received, in order
    pub fn frames(&self) -> Vec<CanFrame> {
        self.with_state(|s| s.frames.clone()).unwrap_or_default()
    }

    fn deliver(&self, frames: Vec<[u8; 8]>) -> ChannelResult<()> {
        if frames.is_empty() {
            return Ok(());
        }
        let cb = self.callback.lock().map_err(poisoned)?.clone();
        let allowed = self.allowed.lock().map_err(poisoned)?.clone();
        if !allowed.is_empty() && !allowed.contains(&self.response_id) {
            return Ok(());
        }
        if let Some(cb) = cb {
            for f in frames {
                cb(CanFrame::new(self.response_id, &f));
            }
        }
        Ok(())
    }
}

impl AdapterCapabilities for SimulatedEcu {
    fn quirks(&self) -> AdapterQuirks {
        self.quirks
    }
}

impl FrameChannel for SimulatedEcu {
    fn open(&self) -> ChannelResult<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> ChannelResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, frame: &CanFrame) -> ChannelResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ChannelError::InterfaceNotOpen);
        }
        let (out, delay) = {
            let mut state = self.lock()?;
            state.frames.push(*frame);
            if frame.id() != self.request_id {
                return Ok(());
            }
            state.on_frame(frame.data(), self.supports_flow_control_bypass())
        };
        if let Some(d) = delay {
            std::thread::sleep(d);
        }
        self.deliver(out)
    }

    fn set_rx_callback(&self, callback: FrameCallback) -> ChannelResult<()> {
        *self.callback.lock().map_err(poisoned)? = Some(callback);
        Ok(())
    }

    fn set_allowed_ids(&self, ids: &[u32]) -> ChannelResult<()> {
        *self.allowed.lock().map_err(poisoned)? = ids.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn capture(ecu: &SimulatedEcu) -> Arc<Mutex<Vec<CanFrame>>> {
        let rx = Arc::new(Mutex::new(Vec::new()));
        let rx_c = rx.clone();
        ecu.set_rx_callback(Arc::new(move |f| rx_c.lock().unwrap().push(f)))
            .unwrap();
        ecu.open().unwrap();
        rx
    }

    #[test]
    fn answers_session_request() {
        let ecu = SimulatedEcu::new(EcuVariant::T8);
        let rx = capture(&ecu);
        ecu.send(&CanFrame::new(0x7E0, &[0x02, 0x10, 0x92, 0, 0, 0, 0, 0]))
            .unwrap();
        let frames = rx.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].data()[..3], &[0x02, 0x50, 0x92]);
    }

    #[test]
    fn segmented_response_waits_for_flow_control() {
        let ecu = SimulatedEcu::new(EcuVariant::T8);
        ecu.set_did(0x90, b"YS3FB45S631000001");
        let rx = capture(&ecu);
        ecu.send(&CanFrame::new(0x7E0, &[0x02, 0x1A, 0x90, 0, 0, 0, 0, 0]))
            .unwrap();
        assert_eq!(rx.lock().unwrap().len(), 1);
        assert_eq!(rx.lock().unwrap()[0].data()[0], 0x10);
        ecu.send(&CanFrame::new(0x7E0, &FlowControl::clear_to_send()))
            .unwrap();
        assert_eq!(rx.lock().unwrap().len(), 3);
    }

    #[test]
    fn sample_collaborators() {
        assert_ne!(
            sample_key([0x12, 0x34], SecurityLevel::Level01),
            sample_key([0x12, 0x34], SecurityLevel::LevelFB)
        );
        assert_ne!(sample_digest(&[1, 2, 3]), sample_digest(&[1, 2, 4]));
    }

    #[test]
    fn closed_channel_refuses_frames() {
        let ecu = SimulatedEcu::new(EcuVariant::T8);
        assert!(matches!(
            ecu.send(&CanFrame::new(0x7E0, &[0x02, 0x10, 0x92])),
            Err(ChannelError::InterfaceNotOpen)
        ));
    }
}
