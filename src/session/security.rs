//! Seed/key security access handshake

use std::time::Duration;

use super::{SessionManager, SessionState};
use crate::{
    kwp2000::{KwpNrc, SecurityLevel},
    DiagError,
};

/// Computes the key for a seed. Implementations are pure and specific to an ECU family
pub trait KeyDerivation {
    /// Derives the 2 byte key answering `seed` at `level`
    fn derive_key(&self, seed: [u8; 2], level: SecurityLevel) -> [u8; 2];
}

impl<F> KeyDerivation for F
where
    F: Fn([u8; 2], SecurityLevel) -> [u8; 2],
{
    fn derive_key(&self, seed: [u8; 2], level: SecurityLevel) -> [u8; 2] {
        self(seed, level)
    }
}

/// Seed returned by an ECU when the requested level is already unlocked
pub const SEED_ALREADY_GRANTED: [u8; 2] = [0x00, 0x00];

/// Outcome of a successful [SessionManager::request_access]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessOutcome {
    /// Key was accepted
    Granted,
    /// ECU reported the level as already unlocked, no key was exchanged
    AlreadyGranted,
}

#[derive(Debug, thiserror::Error)]
/// Error produced by security access
pub enum SecurityError {
    /// Every attempt was refused
    #[error("Security access denied after {attempts} attempt(s): {last_reason}")]
    Denied {
        /// Number of attempts made
        attempts: u32,
        /// Why the ECU refused the last attempt
        last_reason: String,
    },
    /// The ECU's own attempt counter is exhausted. Fatal for this session
    #[error("ECU attempt counter exhausted, security access locked")]
    AttemptsExceeded,
    /// Transport or protocol failure
    #[error("Security access failed: {0}")]
    Transport(
        #[from]
        #[source]
        DiagError,
    ),
}

enum Attempt {
    Retry(String),
    Fatal(SecurityError),
}

fn classify(e: DiagError) -> Attempt {
    match e.nrc() {
        Some(code) if KwpNrc::from(code).is_attempts_exceeded() => {
            Attempt::Fatal(SecurityError::AttemptsExceeded)
        }
        Some(0x35 | 0x37) => Attempt::Retry(e.to_string()),
        _ if e.is_recoverable() => Attempt::Retry(e.to_string()),
        _ => Attempt::Fatal(SecurityError::Transport(e)),
    }
}

impl SessionManager {
    /// Unlocks `level` with a seed/key exchange.
    ///
    /// Any previously granted level is cleared first. `delay` is the mandatory wait between
    /// receiving the seed and submitting the key, during which tester present keeps the session alive.
    pub fn request_access(
        &mut self,
        level: SecurityLevel,
        keys: &dyn KeyDerivation,
        delay: Option<Duration>,
    ) -> Result<AccessOutcome, SecurityError> {
        if self.ctx.state == SessionState::Default {
            return Err(self.invalid_state().into());
        }
        self.ctx.security = None;
        if matches!(self.ctx.state, SessionState::Authenticated(_)) {
            self.ctx.state = SessionState::BootloaderActive;
        }
        if level == SecurityLevel::Public {
            return Ok(AccessOutcome::AlreadyGranted);
        }
        let attempts = self.opts.security_attempts.max(1);
        let mut last_reason = String::new();
        for attempt in 1..=attempts {
            let seed = match self.client.kwp_request_seed(level) {
                Ok(s) => s,
                Err(e) => match classify(e) {
                    Attempt::Retry(reason) => {
                        log::warn!(
                            "Seed request {attempt}/{attempts} for level {level} failed: {reason}"
                        );
                        last_reason = reason;
                        continue;
                    }
                    Attempt::Fatal(e) => return Err(e),
                },
            };
            if seed == SEED_ALREADY_GRANTED {
                log::info!("Security level {level} already granted");
                self.grant(level);
                return Ok(AccessOutcome::AlreadyGranted);
            }
            if let Some(d) = delay {
                log::debug!("Waiting {d:?} before submitting key");
                self.wait_with_keep_alive(d)?;
            }
            let key = keys.derive_key(seed, level);
            log::debug!("Seed {seed:02X?} -> key {key:02X?}");
            match self.client.kwp_send_key(level, key) {
                Ok(true) => {
                    log::info!("Security level {level} granted");
                    self.grant(level);
                    return Ok(AccessOutcome::Granted);
                }
                Ok(false) => {
                    log::warn!("Key {attempt}/{attempts} for level {level} not accepted");
                    last_reason = "key not accepted".into();
                }
                Err(e) => match classify(e) {
                    Attempt::Retry(reason) => {
                        log::warn!("Key {attempt}/{attempts} for level {level} refused: {reason}");
                        last_reason = reason;
                    }
                    Attempt::Fatal(e) => return Err(e),
                },
            }
        }
        log::error!("Security access to level {level} denied");
        Err(SecurityError::Denied {
            attempts,
            last_reason,
        })
    }

    fn grant(&mut self, level: SecurityLevel) {
        self.ctx.security = Some(level);
        if matches!(
            self.ctx.state,
            SessionState::BootloaderActive | SessionState::Authenticated(_)
        ) {
            self.ctx.state = SessionState::Authenticated(level);
        }
    }
}
