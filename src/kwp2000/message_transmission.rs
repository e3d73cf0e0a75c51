//! Message transmission wrapper

use super::{KwpClient, KwpCommand};
use crate::DiagResult;

impl KwpClient {
    /// Tells the ECU to switch off its normal communication paths with other ECUs.
    /// Normal transmission resumes once the ECU is reset.
    ///
    /// NOTE: The rest of the vehicle can no longer talk to the ECU while this is active.
    pub fn kwp_disable_normal_message_transmission(&mut self) -> DiagResult<()> {
        self.send_command(KwpCommand::DisableNormalMessageTransmission, &[0x01])
            .map(|_| ())
    }
}
