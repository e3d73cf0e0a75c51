//! Writes identification records back to the ECU

use super::{KwpClient, KwpCommand};
use crate::{DiagError, DiagResult};

impl KwpClient {
    /// Writes `data` to the local identifier `id`
    pub fn kwp_write_local_identifier(&mut self, id: u8, data: &[u8]) -> DiagResult<()> {
        let mut args = Vec::with_capacity(data.len() + 1);
        args.push(id);
        args.extend_from_slice(data);
        let res = self.send_command(KwpCommand::WriteDataByLocalIdentifier, &args)?;
        match res.get(1) {
            Some(echo) if *echo == id => Ok(()),
            Some(_) => Err(DiagError::WrongMessage),
            None => Err(DiagError::InvalidResponseLength),
        }
    }
}
