//! Segmented message codec
//!
//! Requests and responses longer than a single CAN frame are split into a first frame, which
//! announces the total length, followed by consecutive frames carrying 7 bytes each. The
//! receiver paces the sender with flow control frames.
//!
//! ```text
//! Single frame      0L DD DD DD DD DD DD xx     L = length (1-7)
//! First frame       1L LL DD DD DD DD DD DD     LLL = total length (12 bit)
//! Consecutive frame 2N DD DD DD DD DD DD DD     N = sequence counter (1,2..F,0,1..)
//! Flow control      3S BS ST xx xx xx xx xx     S = status, BS = block size, ST = separation time
//! ```

use std::{sync::Arc, time::Duration};

use crate::{
    channel::{CanFrame, FrameChannel},
    kwp2000::KwpNrc,
    listener::Listener,
    DiagError, DiagResult,
};

/// Largest payload (service + data) sent as a single frame
pub const SINGLE_FRAME_MAX: usize = 6;
/// Largest payload the 12 bit length field can describe
pub const MAX_MESSAGE_LEN: usize = 0xFFF;
/// Byte used to pad frames to 8 bytes
pub const PAD_BYTE: u8 = 0x00;

const FIRST_FRAME_DATA: usize = 6;
const CONSECUTIVE_FRAME_DATA: usize = 7;
const MAX_FLOW_CONTROL_WAITS: u8 = 8;

/// Transfer state of an outgoing segmented message
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlowState {
    /// First frame sent, awaiting the receiver's flow control
    AwaitingFlowControl,
    /// Sending consecutive frames
    Sending,
    /// Every frame has been sent
    Complete,
    /// The transfer was abandoned
    Aborted,
}

/// 4 bit consecutive frame counter, as its wire value (0x20-0x2F)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SequenceCounter(u8);

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceCounter {
    /// Counter for the first consecutive frame (0x21)
    pub const fn new() -> Self {
        Self(0x21)
    }

    /// Current wire value
    pub fn value(self) -> u8 {
        self.0
    }

    /// Moves to the next value, wrapping 0x2F to 0x20
    pub fn advance(&mut self) {
        self.0 = if self.0 == 0x2F { 0x20 } else { self.0 + 1 };
    }
}

/// Flow control status
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlowStatus {
    /// Receiver is ready for consecutive frames
    ContinueToSend,
    /// Receiver asks us to wait for another flow control frame
    Wait,
    /// Receiver cannot accept the message
    Overflow,
}

/// Parsed flow control frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlowControl {
    /// Flow status
    pub status: FlowStatus,
    /// Consecutive frames to send before the next flow control. 0 means no limit
    pub block_size: u8,
    /// Minimum delay between consecutive frames
    pub separation_time: Duration,
}

impl FlowControl {
    /// Parses a flow control frame
    pub fn parse(data: &[u8]) -> DiagResult<Self> {
        if data.len() < 3 || data[0] >> 4 != 0x3 {
            return Err(DiagError::MalformedFrame);
        }
        let status = match data[0] & 0x0F {
            0 => FlowStatus::ContinueToSend,
            1 => FlowStatus::Wait,
            2 => FlowStatus::Overflow,
            _ => return Err(DiagError::MalformedFrame),
        };
        Ok(Self {
            status,
            block_size: data[1],
            separation_time: separation_time(data[2]),
        })
    }

    /// Frame data for a 'continue to send, no limits' flow control frame
    pub fn clear_to_send() -> [u8; 8] {
        let mut data = [PAD_BYTE; 8];
        data[0] = 0x30;
        data[1] = 0x00;
        data[2] = 0x00;
        data
    }
}

fn separation_time(raw: u8) -> Duration {
    match raw {
        0x00..=0x7F => Duration::from_millis(raw as u64),
        0xF1..=0xF9 => Duration::from_micros((raw as u64 - 0xF0) * 100),
        _ => Duration::from_millis(0x7F),
    }
}

/// Builds the single frame for a payload of at most [SINGLE_FRAME_MAX] bytes
pub fn single_frame(payload: &[u8]) -> DiagResult<[u8; 8]> {
    if payload.is_empty() || payload.len() > SINGLE_FRAME_MAX {
        return Err(DiagError::ParameterInvalid);
    }
    let mut data = [PAD_BYTE; 8];
    data[0] = payload.len() as u8;
    data[1..1 + payload.len()].copy_from_slice(payload);
    Ok(data)
}

/// Builds the first frame for a payload longer than [SINGLE_FRAME_MAX] bytes
pub fn first_frame(payload: &[u8]) -> DiagResult<[u8; 8]> {
    if payload.len() <= SINGLE_FRAME_MAX {
        return Err(DiagError::ParameterInvalid);
    }
    if payload.len() > MAX_MESSAGE_LEN {
        return Err(DiagError::MessageTooLong(payload.len()));
    }
    let mut data = [PAD_BYTE; 8];
    data[0] = 0x10 | ((payload.len() >> 8) & 0x0F) as u8;
    data[1] = (payload.len() & 0xFF) as u8;
    data[2..8].copy_from_slice(&payload[..FIRST_FRAME_DATA]);
    Ok(data)
}

/// Builds the consecutive frames which follow [first_frame] for the same payload
pub fn consecutive_frames(payload: &[u8]) -> impl Iterator<Item = [u8; 8]> + '_ {
    let mut counter = SequenceCounter::new();
    payload
        .get(FIRST_FRAME_DATA..)
        .unwrap_or_default()
        .chunks(CONSECUTIVE_FRAME_DATA)
        .map(move |chunk| {
            let mut data = [PAD_BYTE; 8];
            data[0] = counter.value();
            data[1..1 + chunk.len()].copy_from_slice(chunk);
            counter.advance();
            data
        })
}

/// Result of feeding a frame to the [Reassembler]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyStep {
    /// Frame carried nothing of interest
    Ignored,
    /// A first frame started a segmented message, the sender now awaits flow control
    FirstFrame,
    /// A consecutive frame was accepted, more are expected
    Continue,
    /// The message is complete
    Complete(Vec<u8>),
}

/// Rebuilds a message from received frames
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
    expected_len: usize,
    next: Option<SequenceCounter>,
}

impl Reassembler {
    /// Creates an idle reassembler
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a segmented message is partially received
    pub fn in_progress(&self) -> bool {
        self.next.is_some()
    }

    /// Drops any partially received message
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected_len = 0;
        self.next = None;
    }

    /// Feeds a received frame
    pub fn push(&mut self, data: &[u8]) -> DiagResult<ReassemblyStep> {
        if data.iter().all(|b| *b == 0) {
            // No data yet
            return Ok(ReassemblyStep::Ignored);
        }
        let pci = data[0] >> 4;
        match (pci, self.next) {
            (0x2, Some(expected)) => {
                if data[0] != expected.value() {
                    self.reset();
                    return Err(DiagError::Sequence {
                        expected: expected.value(),
                        received: data[0],
                    });
                }
                let take = (self.expected_len - self.buffer.len())
                    .min(CONSECUTIVE_FRAME_DATA)
                    .min(data.len() - 1);
                self.buffer.extend_from_slice(&data[1..1 + take]);
                if self.buffer.len() >= self.expected_len {
                    let msg = std::mem::take(&mut self.buffer);
                    self.reset();
                    Ok(ReassemblyStep::Complete(msg))
                } else {
                    let mut n = expected;
                    n.advance();
                    self.next = Some(n);
                    Ok(ReassemblyStep::Continue)
                }
            }
            (0x2, None) => {
                log::debug!("Consecutive frame without a first frame {data:02X?}, ignoring");
                Ok(ReassemblyStep::Ignored)
            }
            (0x3, _) => Ok(ReassemblyStep::Ignored),
            (0x0 | 0x1, Some(_)) => {
                log::error!("New message started mid transfer {data:02X?}");
                self.reset();
                Err(DiagError::MalformedFrame)
            }
            (0x0, None) => {
                let len = (data[0] & 0x0F) as usize;
                if len == 0 || len > 7 || data.len() < len + 1 {
                    return Err(DiagError::MalformedFrame);
                }
                Ok(ReassemblyStep::Complete(data[1..1 + len].to_vec()))
            }
            (0x1, None) => {
                if data.len() < 8 {
                    return Err(DiagError::MalformedFrame);
                }
                let len = (((data[0] & 0x0F) as usize) << 8) | data[1] as usize;
                if len <= SINGLE_FRAME_MAX {
                    return Err(DiagError::MalformedFrame);
                }
                self.expected_len = len;
                self.buffer.clear();
                self.buffer.extend_from_slice(&data[2..2 + FIRST_FRAME_DATA]);
                self.next = Some(SequenceCounter::new());
                Ok(ReassemblyStep::FirstFrame)
            }
            _ => Err(DiagError::MalformedFrame),
        }
    }
}

/// Segmented message codec bound to a request/response identifier pair
pub struct SegmentedCodec {
    channel: Arc<dyn FrameChannel>,
    listener: Arc<Listener>,
    tx_id: u32,
    rx_id: u32,
    flow_control_timeout: Duration,
    state: FlowState,
}

impl std::fmt::Debug for SegmentedCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedCodec")
            .field("tx_id", &format_args!("0x{:03X}", self.tx_id))
            .field("rx_id", &format_args!("0x{:03X}", self.rx_id))
            .field("state", &self.state)
            .finish()
    }
}

impl SegmentedCodec {
    /// Creates a codec sending on `tx_id` and receiving on `rx_id`
    pub fn new(
        channel: Arc<dyn FrameChannel>,
        listener: Arc<Listener>,
        tx_id: u32,
        rx_id: u32,
        flow_control_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            listener,
            tx_id,
            rx_id,
            flow_control_timeout,
            state: FlowState::Complete,
        }
    }

    /// The channel this codec transmits on
    pub fn channel(&self) -> &Arc<dyn FrameChannel> {
        &self.channel
    }

    /// The listener this codec receives from
    pub fn listener(&self) -> &Arc<Listener> {
        &self.listener
    }

    /// Request identifier
    pub fn tx_id(&self) -> u32 {
        self.tx_id
    }

    /// Response identifier
    pub fn rx_id(&self) -> u32 {
        self.rx_id
    }

    /// State of the last outgoing message
    pub fn flow_state(&self) -> FlowState {
        self.state
    }

    fn transmit(&self, data: &[u8], replies: Option<u8>) -> DiagResult<()> {
        let mut frame = CanFrame::new(self.tx_id, data);
        if let Some(hint) = replies.and_then(|r| self.channel.expected_response_count_hint(r)) {
            frame = frame.with_response_hint(hint);
        }
        log::debug!("Tx 0x{:03X}: {:02X?}", self.tx_id, frame.data());
        self.channel.send(&frame)?;
        Ok(())
    }

    /// Sends a payload, segmenting it if required.
    ///
    /// The listener is armed for the response identifier before the first frame leaves,
    /// so the caller can go straight to [SegmentedCodec::receive] afterwards.
    pub fn send(&mut self, payload: &[u8]) -> DiagResult<()> {
        self.listener.setup_wait(&[self.rx_id]);
        let res = self.send_inner(payload);
        self.state = if res.is_ok() {
            FlowState::Complete
        } else {
            FlowState::Aborted
        };
        res
    }

    fn send_inner(&mut self, payload: &[u8]) -> DiagResult<()> {
        if payload.is_empty() {
            return Err(DiagError::ParameterInvalid);
        }
        if payload.len() > MAX_MESSAGE_LEN {
            return Err(DiagError::MessageTooLong(payload.len()));
        }
        self.state = FlowState::Sending;
        if payload.len() <= SINGLE_FRAME_MAX {
            return self.transmit(&single_frame(payload)?, Some(1));
        }

        self.transmit(&first_frame(payload)?, Some(1))?;
        self.state = FlowState::AwaitingFlowControl;
        let mut fc = self.await_flow_control()?;
        self.state = FlowState::Sending;

        let total = payload[FIRST_FRAME_DATA..].len().div_ceil(CONSECUTIVE_FRAME_DATA);
        let mut in_block = 0u8;
        for (idx, frame) in consecutive_frames(payload).enumerate() {
            if fc.block_size != 0 && in_block == fc.block_size {
                self.state = FlowState::AwaitingFlowControl;
                fc = self.await_flow_control()?;
                self.state = FlowState::Sending;
                in_block = 0;
            } else if idx != 0 && !fc.separation_time.is_zero() {
                std::thread::sleep(fc.separation_time);
            }
            let last = idx + 1 == total;
            let replies = if last || (fc.block_size != 0 && in_block + 1 == fc.block_size) {
                Some(1)
            } else {
                None
            };
            self.transmit(&frame, replies)?;
            in_block = in_block.wrapping_add(1);
        }
        Ok(())
    }

    /// Waits for the ECU's flow control frame.
    ///
    /// 'Wait' flow control and 'response pending' negative responses both restart the wait,
    /// together at most 8 times. Any other negative response ends the transfer.
    fn await_flow_control(&self) -> DiagResult<FlowControl> {
        let mut waits = 0;
        loop {
            let frame = self
                .listener
                .wait_for(&[self.rx_id], self.flow_control_timeout)
                .ok_or_else(|| {
                    log::error!("Timeout awaiting flow control");
                    DiagError::Timeout
                })?;
            if frame.is_zeroed() {
                continue;
            }
            let data = frame.data();
            match data[0] >> 4 {
                0x3 => {
                    let fc = FlowControl::parse(data)?;
                    match fc.status {
                        FlowStatus::Overflow => return Err(DiagError::FlowControlRejected),
                        FlowStatus::Wait => {
                            waits += 1;
                            if waits > MAX_FLOW_CONTROL_WAITS {
                                return Err(DiagError::Timeout);
                            }
                            log::debug!("ECU asked us to wait for flow control");
                        }
                        FlowStatus::ContinueToSend => {
                            if fc.block_size > 1 {
                                log::error!(
                                    "Unsupported flow control block size {}",
                                    fc.block_size
                                );
                                return Err(DiagError::FlowControlRejected);
                            }
                            return Ok(fc);
                        }
                    }
                }
                0x0 if data.len() >= 4 && data[1] == 0x7F => {
                    if KwpNrc::from(data[3]).is_response_pending() {
                        waits += 1;
                        if waits > MAX_FLOW_CONTROL_WAITS {
                            return Err(DiagError::Timeout);
                        }
                        log::debug!("ECU response pending while awaiting flow control");
                        continue;
                    }
                    return Err(DiagError::NegativeResponse {
                        service: data[2],
                        code: data[3],
                        reason: KwpNrc::from(data[3]).to_string(),
                    });
                }
                _ => log::debug!("Ignoring {data:02X?} while awaiting flow control"),
            }
        }
    }

    /// Receives one message, waiting up to `timeout` for each frame.
    ///
    /// On a sequence error the listener is flushed and the whole message must be requested again.
    pub fn receive(&mut self, timeout: Duration) -> DiagResult<Vec<u8>> {
        let mut rx = Reassembler::new();
        loop {
            let Some(frame) = self.listener.wait_for(&[self.rx_id], timeout) else {
                if rx.in_progress() {
                    log::warn!("Timeout part way through a segmented response");
                }
                return Err(DiagError::Timeout);
            };
            log::debug!("Rx 0x{:03X}: {:02X?}", frame.id(), frame.data());
            match rx.push(frame.data()) {
                Ok(ReassemblyStep::Complete(msg)) => return Ok(msg),
                Ok(ReassemblyStep::FirstFrame) => {
                    if !self.channel.supports_flow_control_bypass() {
                        self.transmit(&FlowControl::clear_to_send(), None)?;
                    }
                }
                Ok(_) => {}
                Err(e @ DiagError::Sequence { .. }) => {
                    log::warn!("{e}");
                    self.listener.flush();
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(frames: &[[u8; 8]]) -> DiagResult<Vec<u8>> {
        let mut rx = Reassembler::new();
        for f in frames {
            if let ReassemblyStep::Complete(m) = rx.push(f)? {
                return Ok(m);
            }
        }
        Err(DiagError::Timeout)
    }

    #[test]
    fn single_frame_layout() {
        let f = single_frame(&[0x27, 0x01]).unwrap();
        assert_eq!(f, [0x02, 0x27, 0x01, 0, 0, 0, 0, 0]);
        assert!(single_frame(&[0; 7]).is_err());
        assert!(single_frame(&[]).is_err());
    }

    #[test]
    fn first_frame_announces_length() {
        let payload: Vec<u8> = (0..0xF0u32).map(|x| x as u8).collect();
        let f = first_frame(&payload).unwrap();
        assert_eq!(f[0], 0x10);
        assert_eq!(f[1], 0xF0);
        assert_eq!(&f[2..], &payload[..6]);
        assert!(matches!(
            first_frame(&vec![0; 0x1000]),
            Err(DiagError::MessageTooLong(0x1000))
        ));
    }

    #[test]
    fn counter_wraps_to_0x20() {
        let payload = vec![0xAA; 6 + 7 * 17];
        let counters: Vec<u8> = consecutive_frames(&payload).map(|f| f[0]).collect();
        let mut expected = vec![];
        let mut c = 0x21u8;
        for _ in 0..17 {
            expected.push(c);
            c = if c == 0x2F { 0x20 } else { c + 1 };
        }
        assert_eq!(counters, expected);
        assert_eq!(counters[14], 0x2F);
        assert_eq!(counters[15], 0x20);
        assert_eq!(counters[16], 0x21);
    }

    #[test]
    fn segmented_round_trip() {
        for len in [7usize, 12, 13, 14, 0xE6, 0xF0, 0xFFF] {
            let payload: Vec<u8> = (0..len).map(|x| (x * 7 + 1) as u8).collect();
            let mut frames = vec![first_frame(&payload).unwrap()];
            frames.extend(consecutive_frames(&payload));
            assert_eq!(reassemble(&frames).unwrap(), payload, "len {len}");
        }
    }

    #[test]
    fn partial_message_is_in_progress() {
        let payload = vec![0x11; 20];
        let mut rx = Reassembler::new();
        assert!(!rx.in_progress());
        rx.push(&first_frame(&payload).unwrap()).unwrap();
        assert!(rx.in_progress());
        rx.reset();
        assert!(!rx.in_progress());
    }

    #[test]
    fn zeroed_frames_are_skipped() {
        let mut rx = Reassembler::new();
        assert_eq!(rx.push(&[0; 8]).unwrap(), ReassemblyStep::Ignored);
        assert_eq!(
            rx.push(&[0x02, 0x50, 0x92, 0, 0, 0, 0, 0]).unwrap(),
            ReassemblyStep::Complete(vec![0x50, 0x92])
        );
    }

    #[test]
    fn sequence_error_only_on_counter_mismatch() {
        let payload = vec![0x11; 30];
        let mut frames = vec![first_frame(&payload).unwrap()];
        frames.extend(consecutive_frames(&payload));
        frames[2][0] = 0x23;
        match reassemble(&frames) {
            Err(DiagError::Sequence { expected, received }) => {
                assert_eq!(expected, 0x22);
                assert_eq!(received, 0x23);
            }
            other => panic!("unexpected {other:?}"),
        }

        // A new single frame mid transfer is malformed, not a sequence error
        let mut rx = Reassembler::new();
        rx.push(&first_frame(&payload).unwrap()).unwrap();
        assert!(matches!(
            rx.push(&[0x02, 0x7E, 0x00, 0, 0, 0, 0, 0]),
            Err(DiagError::MalformedFrame)
        ));
    }

    #[test]
    fn flow_control_parsing() {
        let fc = FlowControl::parse(&[0x30, 0x00, 0x0A, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(fc.status, FlowStatus::ContinueToSend);
        assert_eq!(fc.separation_time, Duration::from_millis(10));
        let fc = FlowControl::parse(&[0x32, 0x00, 0xF5]).unwrap();
        assert_eq!(fc.status, FlowStatus::Overflow);
        assert_eq!(fc.separation_time, Duration::from_micros(500));
        assert!(FlowControl::parse(&[0x21, 0x00, 0x00]).is_err());
    }
}
