//! Recovery of ECUs left in their bootloader by an earlier failed flash

use super::{
    CancelToken, Collaborators, FlashOptions, FlashReport, FlashState, FlashWorkflow, Phase,
    PhaseExt, WorkflowError,
};
use crate::{
    firmware::FirmwareImage, progress::ActivityKind, session::SessionManager, DiagError,
    DiagResult,
};

/// Identification record only answered by a running bootloader
pub const PROBE_DID: u8 = 0xC1;

/// What the probe found
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// Bootloader answered, the upload must be skipped
    BootloaderRunning,
    /// Nothing answered the probe, the ECU runs its application (or nothing at all)
    ApplicationRunning,
}

/// Asks for `did` to find out if the bootloader is already running
pub fn probe_bootloader(session: &mut SessionManager, did: u8) -> DiagResult<ProbeResult> {
    match session.client().kwp_read_ecu_identification(did) {
        Ok(data) => {
            log::info!("Bootloader answered probe: {data:02X?}");
            Ok(ProbeResult::BootloaderRunning)
        }
        Err(e @ (DiagError::Timeout | DiagError::NegativeResponse { .. })) => {
            log::info!("No bootloader found ({e})");
            Ok(ProbeResult::ApplicationRunning)
        }
        Err(e) => Err(e),
    }
}

/// Flash workflow for an ECU which may already be running its bootloader.
///
/// Uploading a bootloader into a partially erased device can brick it, so the upload
/// only happens when the probe finds no bootloader.
#[derive(Debug)]
pub struct RecoveryWorkflow<'a> {
    flash: FlashWorkflow<'a>,
    probe: Option<ProbeResult>,
}

impl<'a> RecoveryWorkflow<'a> {
    /// Creates a recovery workflow
    pub fn new(
        session: &'a mut SessionManager,
        image: &'a FirmwareImage,
        bootloader: &'a [u8],
        opts: FlashOptions,
    ) -> Self {
        Self {
            flash: FlashWorkflow::new(session, image, bootloader, opts),
            probe: None,
        }
    }

    /// Uses `cancel` for cancellation
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.flash = self.flash.with_cancel(cancel);
        self
    }

    /// Result of the probe, once run
    pub fn probe_result(&self) -> Option<ProbeResult> {
        self.probe
    }

    /// State of the underlying flash workflow
    pub fn state(&self) -> FlashState {
        self.flash.state()
    }

    /// Probes, then flashes
    pub fn run(&mut self, c: &Collaborators<'_>) -> Result<FlashReport, WorkflowError> {
        let res = self.recover(c);
        self.flash.finish(res, c)
    }

    fn recover(&mut self, c: &Collaborators<'_>) -> Result<(), WorkflowError> {
        c.progress
            .on_activity("Probing for bootloader".into(), ActivityKind::Phase);
        let did = self.flash.opts.probe_did;
        let probe = probe_bootloader(self.flash.session(), did).phase(Phase::Probe)?;
        self.probe = Some(probe);
        match probe {
            ProbeResult::BootloaderRunning => {
                c.progress.on_activity(
                    "Bootloader already running, skipping upload".into(),
                    ActivityKind::Info,
                );
                let variant = self.flash.image.variant();
                let session = self.flash.session();
                session.set_variant(variant);
                session.assume_bootloader();
                self.flash.authenticate_bootloader(c)?;
            }
            ProbeResult::ApplicationRunning => self.flash.establish(c)?,
        }
        self.flash.program_phases(c)
    }
}
