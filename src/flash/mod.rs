//! Erase, program and verify workflows
//!
//! [FlashWorkflow] walks
//!
//! ```text
//! Idle -> SessionEstablished -> Erasing -> Programming(block) -> Verifying -> Done
//!                                                                         \-> Failed
//! ```
//!
//! [RecoveryWorkflow] shares every phase but may skip the session and bootloader steps when the
//! ECU is found already running its bootloader. [ReadWorkflow] dumps flash to disk.
//!
//! Whatever the outcome, every workflow attempts to reset the ECU before returning.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use strum_macros::Display;

use crate::{
    firmware::{BlockManager, EcuFamily, FirmwareImage, ImageError, Partition},
    kwp2000::{RoutineId, SecurityLevel, MAX_TRANSFER_DATA},
    progress::{percent, ActivityKind, ProgressSink},
    session::{KeyDerivation, SecurityError, SessionManager},
    DiagError,
};

mod bootloader;
mod erase;
mod read;
mod recovery;
mod verify;

pub use bootloader::*;
pub use erase::*;
pub use read::*;
pub use recovery::*;
pub use verify::*;

/// Flash workflow state
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlashState {
    /// Nothing done yet
    Idle,
    /// Bootloader running and authenticated
    SessionEstablished,
    /// Flash erase in progress
    Erasing,
    /// Programming the given block (or chunk, for partitioned ECUs)
    Programming(u32),
    /// Checking what was written
    Verifying,
    /// Flash written and verified
    Done,
    /// Workflow aborted
    Failed,
}

/// Workflow phase an error is attributed to
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum Phase {
    /// Diagnostic session setup
    #[strum(to_string = "Session")]
    Session,
    /// Security access
    #[strum(to_string = "Security access")]
    Security,
    /// Bootloader upload
    #[strum(to_string = "Bootloader upload")]
    Bootloader,
    /// Probing for a running bootloader
    #[strum(to_string = "Bootloader probe")]
    Probe,
    /// Flash erase
    #[strum(to_string = "Erase")]
    Erase,
    /// Flash programming
    #[strum(to_string = "Programming")]
    Program,
    /// Verification
    #[strum(to_string = "Verification")]
    Verify,
    /// Reading flash
    #[strum(to_string = "Read")]
    Read,
}

/// Region of flash flagged by verification, to be programmed again on a later pass
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Region {
    /// Coded block by index
    Block(u32),
    /// Partition by index
    Partition(u8),
}

#[derive(Debug, thiserror::Error)]
/// Cause of a workflow failure
pub enum WorkflowErrorKind {
    /// ECU refused to erase
    #[error("Erase refused: {0}")]
    EraseRefused(DiagError),
    /// Erase did not complete in time
    #[error("Erase did not complete in time")]
    EraseTimeout,
    /// A block failed too many times
    #[error("Block {index} failed {attempts} time(s), last error: {last}")]
    RetryBudgetExhausted {
        /// Block (or chunk) index
        index: u32,
        /// Attempts made
        attempts: u32,
        /// Last error seen
        last: DiagError,
    },
    /// Written flash differs from the image
    #[error("Verification mismatch in {} region(s)", .0.len())]
    VerificationMismatch(Vec<Region>),
    /// Cancelled by the caller
    #[error("Cancelled")]
    Cancelled,
    /// Security access failed
    #[error(transparent)]
    Security(#[from] SecurityError),
    /// Transport or protocol failure
    #[error(transparent)]
    Diag(#[from] DiagError),
    /// Firmware image problem
    #[error(transparent)]
    Image(#[from] ImageError),
    /// Bootloader could not be uploaded or started
    #[error("Bootloader upload failed: {0}")]
    BootloaderUpload(DiagError),
    /// Dump could not be written
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
#[error("{phase}: {kind}")]
/// Terminal workflow failure, attributed to a phase
pub struct WorkflowError {
    /// Phase which failed
    pub phase: Phase,
    /// What went wrong
    #[source]
    pub kind: WorkflowErrorKind,
}

impl WorkflowError {
    /// Attributes `kind` to `phase`
    pub fn new<K: Into<WorkflowErrorKind>>(phase: Phase, kind: K) -> Self {
        Self {
            phase,
            kind: kind.into(),
        }
    }

    /// Regions to program again, if verification failed
    pub fn mismatched_regions(&self) -> Option<&[Region]> {
        match &self.kind {
            WorkflowErrorKind::VerificationMismatch(r) => Some(r),
            _ => None,
        }
    }
}

pub(crate) trait PhaseExt<T> {
    fn phase(self, phase: Phase) -> Result<T, WorkflowError>;
}

impl<T, E: Into<WorkflowErrorKind>> PhaseExt<T> for Result<T, E> {
    fn phase(self, phase: Phase) -> Result<T, WorkflowError> {
        self.map_err(|e| WorkflowError::new(phase, e))
    }
}

/// Cooperative cancellation, honoured at block boundaries
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token which is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst)
    }

    /// True once cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Computes partition digests and writes hash sidecar files
pub trait DigestProvider {
    /// 16 byte digest of `data`, matching the ECU's partition digest routine
    fn digest(&self, data: &[u8]) -> [u8; 16];
    /// Writes the hash of `data` next to `path`
    fn write_sidecar_hash(&self, path: &Path, data: &[u8]) -> std::io::Result<()>;
}

/// External collaborators used by the workflows
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    /// Seed to key derivation
    pub keys: &'a dyn KeyDerivation,
    /// Partition digests and sidecar hashes
    pub digest: &'a dyn DigestProvider,
    /// Progress reporting
    pub progress: &'a dyn ProgressSink,
}

impl std::fmt::Debug for Collaborators<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Workflow tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashOptions {
    /// Attempts per block before the workflow aborts
    pub block_retry_budget: u32,
    /// Erase deadline and inactivity limit
    pub erase: ErasePolicy,
    /// Mandatory wait between seed and key
    pub security_delay: Option<Duration>,
    /// Security level requested from the bootloader
    pub bootloader_level: SecurityLevel,
    /// RAM address the bootloader is loaded to and started from
    pub bootloader_address: u32,
    /// Bytes per memory read during verification and read-back
    pub read_chunk: u8,
    /// Identification record only the bootloader answers
    pub probe_did: u8,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            block_retry_budget: 3,
            erase: ErasePolicy::default(),
            security_delay: None,
            bootloader_level: SecurityLevel::LevelFB,
            bootloader_address: BOOTLOADER_ADDRESS,
            read_chunk: 0x80,
            probe_did: PROBE_DID,
        }
    }
}

/// Summary of a successful flash
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashReport {
    /// True if a bootloader was uploaded
    pub bootloader_uploaded: bool,
    /// Blocks (or partition chunks) programmed
    pub blocks_written: u32,
    /// Bytes programmed
    pub bytes_written: u64,
    /// Partitions erased and programmed
    pub partitions: Vec<u8>,
}

/// Erases, programs and verifies an ECU
#[derive(Debug)]
pub struct FlashWorkflow<'a> {
    session: &'a mut SessionManager,
    image: &'a FirmwareImage,
    bootloader: &'a [u8],
    opts: FlashOptions,
    cancel: CancelToken,
    state: FlashState,
    selected: Option<Vec<u8>>,
    report: FlashReport,
}

impl<'a> FlashWorkflow<'a> {
    /// Creates a workflow writing `image`, using `bootloader` to gain flash access
    pub fn new(
        session: &'a mut SessionManager,
        image: &'a FirmwareImage,
        bootloader: &'a [u8],
        opts: FlashOptions,
    ) -> Self {
        Self {
            session,
            image,
            bootloader,
            opts,
            cancel: CancelToken::new(),
            state: FlashState::Idle,
            selected: None,
            report: FlashReport::default(),
        }
    }

    /// Uses `cancel` for cancellation
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Restricts a partitioned flash to the given partitions
    pub fn select_partitions(&mut self, partitions: Vec<u8>) {
        self.selected = Some(partitions);
    }

    /// Arms the regions a failed verification reported for the next pass.
    ///
    /// Block coded ECUs are erased as a whole, so any mismatch re-arms the full flash.
    pub fn rearm(&mut self, regions: &[Region]) {
        let partitions: Vec<u8> = regions
            .iter()
            .filter_map(|r| match r {
                Region::Partition(p) => Some(*p),
                Region::Block(_) => None,
            })
            .collect();
        self.selected = if partitions.is_empty() {
            None
        } else {
            Some(partitions)
        };
        self.state = FlashState::Idle;
        self.report = FlashReport::default();
    }

    /// Current state
    pub fn state(&self) -> FlashState {
        self.state
    }

    /// The session the workflow runs on
    pub fn session(&mut self) -> &mut SessionManager {
        &mut *self.session
    }

    /// Runs the whole workflow
    pub fn run(&mut self, c: &Collaborators<'_>) -> Result<FlashReport, WorkflowError> {
        let res = self.establish(c).and_then(|_| self.program_phases(c));
        self.finish(res, c)
    }

    pub(crate) fn finish(
        &mut self,
        res: Result<(), WorkflowError>,
        c: &Collaborators<'_>,
    ) -> Result<FlashReport, WorkflowError> {
        let res = match res {
            Ok(()) => {
                self.state = FlashState::Done;
                c.progress.on_progress(100);
                c.progress
                    .on_activity("Flash complete".into(), ActivityKind::Info);
                Ok(std::mem::take(&mut self.report))
            }
            Err(e) => {
                self.state = FlashState::Failed;
                c.progress.on_activity(e.to_string(), ActivityKind::Error);
                Err(e)
            }
        };
        if self.session.exit().is_err() {
            c.progress
                .on_activity("ECU did not confirm reset".into(), ActivityKind::Warning);
        }
        res
    }

    pub(crate) fn establish(&mut self, c: &Collaborators<'_>) -> Result<(), WorkflowError> {
        self.session.set_variant(self.image.variant());
        establish_bootloader(self.session, self.bootloader, &self.opts, c)?;
        self.report.bootloader_uploaded = true;
        self.state = FlashState::SessionEstablished;
        Ok(())
    }

    /// Requests the bootloader security level from a running bootloader
    pub(crate) fn authenticate_bootloader(
        &mut self,
        c: &Collaborators<'_>,
    ) -> Result<(), WorkflowError> {
        self.session
            .request_access(self.opts.bootloader_level, c.keys, self.opts.security_delay)
            .phase(Phase::Security)?;
        self.state = FlashState::SessionEstablished;
        Ok(())
    }

    pub(crate) fn program_phases(&mut self, c: &Collaborators<'_>) -> Result<(), WorkflowError> {
        if !self.session.is_programming_allowed() {
            return Err(WorkflowError::new(
                Phase::Session,
                DiagError::InvalidState(self.session.state().to_string()),
            ));
        }
        match self.image.variant().family() {
            EcuFamily::BlockCoded => self.flash_blocks(c),
            EcuFamily::Partitioned => self.flash_partitions(c),
        }
    }

    fn check_cancel(&self, phase: Phase) -> Result<(), WorkflowError> {
        if self.cancel.is_cancelled() {
            log::warn!("Cancelled during {phase}");
            return Err(WorkflowError::new(phase, WorkflowErrorKind::Cancelled));
        }
        Ok(())
    }

    fn flash_blocks(&mut self, c: &Collaborators<'_>) -> Result<(), WorkflowError> {
        let mut blocks = BlockManager::new(self.image);
        let count = blocks.block_count();

        self.check_cancel(Phase::Erase)?;
        self.state = FlashState::Erasing;
        c.progress
            .on_activity("Erasing flash".into(), ActivityKind::Phase);
        erase(self.session, RoutineId::EraseFlash, &[], &self.opts.erase).phase(Phase::Erase)?;

        c.progress
            .on_activity(format!("Programming {count} blocks"), ActivityKind::Phase);
        {
            let _stall = self.session.stall();
            while let Some(block) = blocks.next_block() {
                self.check_cancel(Phase::Program)?;
                self.state = FlashState::Programming(block.index);
                let request = block.to_transfer_request().phase(Phase::Program)?;
                self.with_retries(block.index, |s| {
                    let client = s.client();
                    client.kwp_request_download(block.address, block.payload.len() as u32)?;
                    client.kwp_transfer_raw(&request)
                })?;
                self.session.send_keep_alive().phase(Phase::Program)?;
                self.report.blocks_written += 1;
                self.report.bytes_written += block.payload.len() as u64;
                c.progress
                    .on_progress(percent(u64::from(block.index) + 1, u64::from(count)));
            }
            self.session
                .client()
                .kwp_transfer_exit()
                .phase(Phase::Program)?;
        }

        self.state = FlashState::Verifying;
        c.progress
            .on_activity("Verifying flash".into(), ActivityKind::Phase);
        let mismatched = verify_blocks(self.session, self.image, count, self.opts.read_chunk)
            .phase(Phase::Verify)?;
        if !mismatched.is_empty() {
            return Err(WorkflowError::new(
                Phase::Verify,
                WorkflowErrorKind::VerificationMismatch(
                    mismatched.into_iter().map(Region::Block).collect(),
                ),
            ));
        }
        Ok(())
    }

    fn selected_partitions(&self) -> Result<Vec<Partition>, WorkflowError> {
        let blocks = BlockManager::new(self.image);
        let table = blocks.partitions().phase(Phase::Erase)?;
        match &self.selected {
            None => Ok(table.iter().filter(|p| p.writable).copied().collect()),
            Some(sel) => {
                let mut parts = Vec::with_capacity(sel.len());
                for idx in sel {
                    let p = blocks
                        .partition_for(*idx as usize)
                        .phase(Phase::Erase)?;
                    if !p.writable {
                        log::warn!("Partition {idx} is not writable, skipping");
                        continue;
                    }
                    parts.push(p);
                }
                parts.sort_by_key(|p| p.phys_start);
                parts.dedup();
                Ok(parts)
            }
        }
    }

    fn flash_partitions(&mut self, c: &Collaborators<'_>) -> Result<(), WorkflowError> {
        let partitions = self.selected_partitions()?;
        let total: u64 = partitions.iter().map(|p| p.len() as u64).sum();
        let mut chunk_index = 0u32;
        let mut done = 0u64;
        for p in &partitions {
            self.check_cancel(Phase::Erase)?;
            self.state = FlashState::Erasing;
            c.progress.on_activity(
                format!("Erasing partition {}", p.index),
                ActivityKind::Phase,
            );
            erase(self.session, RoutineId::ErasePartition, &[p.index], &self.opts.erase)
                .phase(Phase::Erase)?;

            let data = p.slice(self.image).ok_or_else(|| {
                WorkflowError::new(
                    Phase::Program,
                    ImageError::PartitionOutOfRange {
                        index: p.index as usize,
                        count: partitions.len(),
                    },
                )
            })?;
            c.progress.on_activity(
                format!("Programming partition {}", p.index),
                ActivityKind::Phase,
            );
            let _stall = self.session.stall();
            self.session
                .client()
                .kwp_request_download(p.phys_start, p.len() as u32)
                .phase(Phase::Program)?;
            for (n, chunk) in data.chunks(MAX_TRANSFER_DATA).enumerate() {
                self.check_cancel(Phase::Program)?;
                self.state = FlashState::Programming(chunk_index);
                let address = p.phys_start + (n * MAX_TRANSFER_DATA) as u32;
                self.with_retries(chunk_index, |s| s.client().kwp_transfer_data(address, chunk))?;
                self.session.send_keep_alive().phase(Phase::Program)?;
                chunk_index += 1;
                done += chunk.len() as u64;
                self.report.blocks_written += 1;
                self.report.bytes_written += chunk.len() as u64;
                c.progress.on_progress(percent(done, total));
            }
            self.session
                .client()
                .kwp_transfer_exit()
                .phase(Phase::Program)?;
            self.report.partitions.push(p.index);
        }

        self.state = FlashState::Verifying;
        c.progress
            .on_activity("Verifying partitions".into(), ActivityKind::Phase);
        let mismatched = verify_partitions(self.session, self.image, &partitions, c.digest)
            .phase(Phase::Verify)?;
        if !mismatched.is_empty() {
            return Err(WorkflowError::new(
                Phase::Verify,
                WorkflowErrorKind::VerificationMismatch(
                    mismatched.into_iter().map(Region::Partition).collect(),
                ),
            ));
        }
        Ok(())
    }

    /// Runs `op` until it succeeds or the block retry budget is spent
    fn with_retries<F>(&mut self, index: u32, mut op: F) -> Result<(), WorkflowError>
    where
        F: FnMut(&mut SessionManager) -> Result<(), DiagError>,
    {
        let budget = self.opts.block_retry_budget.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(&mut *self.session) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < budget => {
                    log::warn!("Block {index} attempt {attempt}/{budget} failed: {e}");
                    self.session.client().flush();
                }
                Err(e) => {
                    log::error!("Block {index} failed {attempt} time(s), aborting");
                    return Err(WorkflowError::new(
                        Phase::Program,
                        WorkflowErrorKind::RetryBudgetExhausted {
                            index,
                            attempts: attempt,
                            last: e,
                        },
                    ));
                }
            }
        }
    }
}

/// Elapsed-time helper for inline keep-alives in long loops
#[derive(Debug)]
pub(crate) struct InlineKeepAlive {
    last: Instant,
    period: Duration,
}

impl InlineKeepAlive {
    pub(crate) fn new(session: &SessionManager) -> Self {
        Self {
            last: Instant::now(),
            period: session.options().keep_alive_period,
        }
    }

    pub(crate) fn tick(&mut self, session: &mut SessionManager) -> Result<(), DiagError> {
        if self.last.elapsed() >= self.period {
            self.last = Instant::now();
            session.send_keep_alive()?;
        }
        Ok(())
    }
}
