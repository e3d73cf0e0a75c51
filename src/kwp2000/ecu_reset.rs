//! This service requests the ECU to perform a reset

use super::{KwpClient, KwpCommand};
use crate::DiagResult;

/// ECU Reset types
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResetMode {
    /// Simulates a power off/on reset of the ECU. Leaves any bootloader
    PowerOnReset,
}

impl From<ResetMode> for u8 {
    fn from(x: ResetMode) -> Self {
        match x {
            ResetMode::PowerOnReset => 0x01,
        }
    }
}

impl KwpClient {
    /// Performs an ECU Reset operation
    pub fn kwp_reset_ecu(&mut self, mode: ResetMode) -> DiagResult<()> {
        self.send_command(KwpCommand::ECUReset, &[mode.into()])?;
        Ok(())
    }
}
