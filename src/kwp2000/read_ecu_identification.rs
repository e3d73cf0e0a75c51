//! Reading and writing identification records (DIDs)

use super::{KwpClient, KwpCommand};
use crate::{DiagError, DiagResult};

impl KwpClient {
    /// Reads an identification record from the ECU, returning just its data
    pub fn kwp_read_ecu_identification(&mut self, id: u8) -> DiagResult<Vec<u8>> {
        let mut res = self.send_command(KwpCommand::ReadECUIdentification, &[id])?;
        match res.get(1) {
            Some(echo) if *echo == id => {
                res.drain(0..2);
                Ok(res)
            }
            Some(_) => Err(DiagError::WrongMessage),
            None => Err(DiagError::InvalidResponseLength),
        }
    }
}
