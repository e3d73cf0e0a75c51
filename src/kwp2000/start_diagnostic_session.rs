//! Provides methods to manipulate the ECUs diagnostic session mode

use super::{KwpClient, KwpCommand};
use crate::{DiagError, DiagResult};

/// KWP2000 diagnostic session type
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum KwpSessionType {
    /// Extended diagnostics mode. Every service is available here
    ExtendedDiagnostics,
}

impl From<KwpSessionType> for u8 {
    fn from(x: KwpSessionType) -> Self {
        match x {
            KwpSessionType::ExtendedDiagnostics => 0x92,
        }
    }
}

impl KwpClient {
    /// Sets the ECU into a diagnostic mode.
    /// The ECU must echo the requested mode in its positive response
    pub fn kwp_set_session(&mut self, mode: KwpSessionType) -> DiagResult<()> {
        let mode_byte: u8 = mode.into();
        let res = self.send_command(KwpCommand::StartDiagnosticSession, &[mode_byte])?;
        match res.get(1) {
            Some(m) if *m == mode_byte => Ok(()),
            Some(_) => Err(DiagError::WrongMessage),
            None => Err(DiagError::InvalidResponseLength),
        }
    }
}
