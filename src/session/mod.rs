//! Diagnostic session state, security access and keep-alive supervision
//!
//! [SessionManager] owns the [KwpClient] and a [SessionContext]. All session state lives in the
//! context, which the flash workflows borrow through the manager; nothing is kept in statics.
//!
//! ```text
//! Default -> ExtendedDiagnostic -> ProgrammingRequested -> BootloaderActive -> Authenticated(level)
//! ```
//!
//! A negative response never changes the state.

use std::{fmt, sync::Arc, time::Duration};

use crate::{
    did_file::DidSnapshot,
    firmware::EcuVariant,
    kwp2000::{KwpClient, KwpSessionType, ResetMode, SecurityLevel},
    DiagError, DiagResult,
};

mod keep_alive;
mod security;

pub use keep_alive::*;
pub use security::*;

/// Diagnostic session state
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// ECU runs its application in the default session
    Default,
    /// Extended diagnostic session is active
    ExtendedDiagnostic,
    /// Normal communication is disabled, the ECU awaits a download
    ProgrammingRequested,
    /// The flash bootloader runs from RAM
    BootloaderActive,
    /// The bootloader granted a security level
    Authenticated(SecurityLevel),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Default => write!(f, "default"),
            SessionState::ExtendedDiagnostic => write!(f, "extended diagnostic"),
            SessionState::ProgrammingRequested => write!(f, "programming requested"),
            SessionState::BootloaderActive => write!(f, "bootloader active"),
            SessionState::Authenticated(l) => write!(f, "authenticated ({l})"),
        }
    }
}

/// Per operation session state, threaded through the workflows
#[derive(Debug)]
pub struct SessionContext {
    /// Current session state
    pub state: SessionState,
    /// Currently granted security level. Requesting a new level clears this
    pub security: Option<SecurityLevel>,
    /// ECU variant being worked on, once known
    pub variant: Option<EcuVariant>,
    /// Stall flag shared with the keep-alive task
    pub stall: Arc<StallFlag>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            state: SessionState::Default,
            security: None,
            variant: None,
            stall: Arc::new(StallFlag::new()),
        }
    }
}

/// Session tunables
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Period of the tester present keep-alive
    pub keep_alive_period: Duration,
    /// Seed/key attempts before access is reported as denied
    pub security_attempts: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            keep_alive_period: Duration::from_millis(2000),
            security_attempts: 3,
        }
    }
}

/// Drives session transitions, security access and the keep-alive
#[derive(Debug)]
pub struct SessionManager {
    client: KwpClient,
    ctx: SessionContext,
    opts: SessionOptions,
    keep_alive: Option<KeepAlive>,
}

impl SessionManager {
    /// Creates a manager for an ECU in the default session
    pub fn new(client: KwpClient, opts: SessionOptions) -> Self {
        Self {
            client,
            ctx: SessionContext::default(),
            opts,
            keep_alive: None,
        }
    }

    /// The KWP2000 client
    pub fn client(&mut self) -> &mut KwpClient {
        &mut self.client
    }

    /// Session context
    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.ctx.state
    }

    /// Currently granted security level
    pub fn security(&self) -> Option<SecurityLevel> {
        self.ctx.security
    }

    /// Session tunables
    pub fn options(&self) -> &SessionOptions {
        &self.opts
    }

    /// Records the ECU variant being worked on
    pub fn set_variant(&mut self, variant: EcuVariant) {
        self.ctx.variant = Some(variant)
    }

    /// The running keep-alive task, if any
    pub fn keep_alive(&self) -> Option<&KeepAlive> {
        self.keep_alive.as_ref()
    }

    /// Stalls the periodic keep-alive. The caller sends its own with
    /// [SessionManager::send_keep_alive] until the guard is dropped
    pub fn stall(&self) -> StallGuard {
        self.ctx.stall.stall()
    }

    fn invalid_state(&self) -> DiagError {
        DiagError::InvalidState(self.ctx.state.to_string())
    }

    fn start_keep_alive(&mut self) {
        if self.keep_alive.as_ref().is_some_and(|k| k.is_running()) {
            return;
        }
        let codec = self.client.codec();
        self.keep_alive = Some(KeepAlive::start(
            codec.channel().clone(),
            codec.tx_id(),
            self.ctx.stall.clone(),
            self.opts.keep_alive_period,
        ));
    }

    fn stop_keep_alive(&mut self) {
        if let Some(mut k) = self.keep_alive.take() {
            k.stop();
            log::debug!(
                "Keep-alive stopped after {} frame(s), {} period(s) skipped",
                k.frames_sent(),
                k.periods_skipped()
            );
        }
    }

    /// Enters the extended diagnostic session and starts the keep-alive
    pub fn start_extended_session(&mut self) -> DiagResult<()> {
        if !matches!(
            self.ctx.state,
            SessionState::Default | SessionState::ExtendedDiagnostic
        ) {
            return Err(self.invalid_state());
        }
        self.client
            .kwp_set_session(KwpSessionType::ExtendedDiagnostics)?;
        log::info!("Extended diagnostic session active");
        self.ctx.state = SessionState::ExtendedDiagnostic;
        self.start_keep_alive();
        Ok(())
    }

    /// Disables normal communication, preparing the ECU for a download
    pub fn disable_normal_communication(&mut self) -> DiagResult<()> {
        if self.ctx.state != SessionState::ExtendedDiagnostic {
            return Err(self.invalid_state());
        }
        self.client.kwp_disable_normal_message_transmission()?;
        self.ctx.state = SessionState::ProgrammingRequested;
        Ok(())
    }

    /// Records that the uploaded bootloader is now executing.
    /// The application's security grant does not carry over into the bootloader
    pub fn mark_bootloader_active(&mut self) -> DiagResult<()> {
        if self.ctx.state != SessionState::ProgrammingRequested {
            return Err(self.invalid_state());
        }
        log::info!("Bootloader active");
        self.ctx.state = SessionState::BootloaderActive;
        self.ctx.security = None;
        Ok(())
    }

    /// Adopts an ECU found already running its bootloader
    pub fn assume_bootloader(&mut self) {
        log::info!("Assuming bootloader is already running");
        self.ctx.state = SessionState::BootloaderActive;
        self.ctx.security = None;
        self.start_keep_alive();
    }

    /// True if the session may erase and program flash
    pub fn is_programming_allowed(&self) -> bool {
        matches!(self.ctx.state, SessionState::Authenticated(_))
    }

    /// Sends one tester present, unless the periodic task is sending one right now
    pub fn send_keep_alive(&mut self) -> DiagResult<()> {
        if self.ctx.stall.is_stalled() {
            return self.client.kwp_tester_present();
        }
        match self.ctx.stall.try_begin_send() {
            Some(_permit) => self.client.kwp_tester_present(),
            None => Ok(()),
        }
    }

    /// Waits `delay`, keeping the session alive meanwhile
    pub fn wait_with_keep_alive(&mut self, delay: Duration) -> DiagResult<()> {
        let period = self.opts.keep_alive_period.max(Duration::from_millis(10));
        let mut remaining = delay;
        while !remaining.is_zero() {
            let step = remaining.min(period);
            std::thread::sleep(step);
            remaining -= step;
            if step == period {
                self.send_keep_alive()?;
            }
        }
        Ok(())
    }

    /// Reads the given identification records into a snapshot
    pub fn read_dids(&mut self, ids: &[u8]) -> DiagResult<DidSnapshot> {
        let _stall = self.stall();
        let mut snapshot = DidSnapshot::default();
        for id in ids {
            let data = self.client.kwp_read_ecu_identification(*id)?;
            log::debug!("DID 0x{id:02X}: {data:02X?}");
            snapshot.insert(*id, data);
        }
        Ok(snapshot)
    }

    /// Writes every record of a snapshot back to the ECU
    pub fn write_dids(&mut self, snapshot: &DidSnapshot) -> DiagResult<()> {
        let _stall = self.stall();
        for (id, data) in snapshot.records() {
            self.client.kwp_write_local_identifier(*id, data)?;
        }
        Ok(())
    }

    /// Leaves diagnostics by resetting the ECU, which also leaves any bootloader.
    ///
    /// The session is considered closed even if the reset fails.
    pub fn exit(&mut self) -> DiagResult<()> {
        self.stop_keep_alive();
        let res = self.client.kwp_reset_ecu(ResetMode::PowerOnReset);
        self.ctx.state = SessionState::Default;
        self.ctx.security = None;
        match &res {
            Ok(()) => log::info!("ECU reset, session closed"),
            Err(e) => log::warn!("ECU reset failed: {e}"),
        }
        res
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop_keep_alive()
    }
}
