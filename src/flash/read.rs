//! Reading flash back to a file

use std::path::Path;

use super::{
    establish_bootloader, read_flash, CancelToken, Collaborators, FlashOptions, Phase, PhaseExt,
    WorkflowError, WorkflowErrorKind,
};
use crate::{
    firmware::{partition_table, EcuFamily, EcuVariant},
    progress::{percent, ActivityKind},
    session::SessionManager,
};

const SEGMENT_LEN: u32 = 0x1000;

/// Read workflow state
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadState {
    /// Nothing done yet
    Idle,
    /// Bootloader running and authenticated
    SessionEstablished,
    /// Reading, with the number of bytes read so far
    Reading(u32),
    /// Dump written
    Done,
    /// Workflow aborted
    Failed,
}

/// Dumps the flash of an ECU to disk, with a hash sidecar
#[derive(Debug)]
pub struct ReadWorkflow<'a> {
    session: &'a mut SessionManager,
    bootloader: &'a [u8],
    opts: FlashOptions,
    cancel: CancelToken,
    state: ReadState,
}

impl<'a> ReadWorkflow<'a> {
    /// Creates a read workflow
    pub fn new(session: &'a mut SessionManager, bootloader: &'a [u8], opts: FlashOptions) -> Self {
        Self {
            session,
            bootloader,
            opts,
            cancel: CancelToken::new(),
            state: ReadState::Idle,
        }
    }

    /// Uses `cancel` for cancellation
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Current state
    pub fn state(&self) -> ReadState {
        self.state
    }

    /// Reads the whole flash of a `variant` ECU into `path`, returning the image
    pub fn run(
        &mut self,
        variant: EcuVariant,
        path: &Path,
        c: &Collaborators<'_>,
    ) -> Result<Vec<u8>, WorkflowError> {
        let res = self.read(variant, path, c);
        self.state = if res.is_ok() {
            ReadState::Done
        } else {
            ReadState::Failed
        };
        if let Err(e) = &res {
            c.progress.on_activity(e.to_string(), ActivityKind::Error);
        }
        if self.session.exit().is_err() {
            c.progress
                .on_activity("ECU did not confirm reset".into(), ActivityKind::Warning);
        }
        res
    }

    fn read(
        &mut self,
        variant: EcuVariant,
        path: &Path,
        c: &Collaborators<'_>,
    ) -> Result<Vec<u8>, WorkflowError> {
        self.session.set_variant(variant);
        establish_bootloader(self.session, self.bootloader, &self.opts, c)?;
        self.state = ReadState::SessionEstablished;

        // (flash address, image offset, length)
        let regions: Vec<(u32, u32, u32)> = match variant.family() {
            EcuFamily::BlockCoded => vec![(0, 0, variant.image_len() as u32)],
            EcuFamily::Partitioned => partition_table(variant)
                .phase(Phase::Read)?
                .iter()
                .map(|p| (p.phys_start, p.file_start, p.len() as u32))
                .collect(),
        };

        c.progress
            .on_activity(format!("Reading {variant} flash"), ActivityKind::Phase);
        let total = variant.image_len() as u64;
        let mut image = vec![0u8; variant.image_len()];
        let mut done = 0u32;
        for (phys, file, len) in regions {
            let mut offset = 0;
            while offset < len {
                if self.cancel.is_cancelled() {
                    return Err(WorkflowError::new(Phase::Read, WorkflowErrorKind::Cancelled));
                }
                let n = (len - offset).min(SEGMENT_LEN);
                let data = read_flash(self.session, phys + offset, n, self.opts.read_chunk)
                    .phase(Phase::Read)?;
                let at = (file + offset) as usize;
                image[at..at + data.len()].copy_from_slice(&data);
                offset += n;
                done += n;
                self.state = ReadState::Reading(done);
                c.progress.on_progress(percent(u64::from(done), total));
            }
        }

        std::fs::write(path, &image).phase(Phase::Read)?;
        c.digest.write_sidecar_hash(path, &image).phase(Phase::Read)?;
        c.progress
            .on_activity(format!("Flash saved to {}", path.display()), ActivityKind::Info);
        Ok(image)
    }
}
