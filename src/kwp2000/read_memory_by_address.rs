//! Reads contents from the ECU's memory

use super::{KwpClient, KwpCommand};
use crate::{DiagError, DiagResult};

/// Largest address the 3 byte address field can carry
pub const MAX_MEMORY_ADDRESS: u32 = 0xFFFFFF;

/// Builds the request for [KwpClient::kwp_read_memory]
pub fn read_memory_request(address: u32, size: u8) -> DiagResult<[u8; 5]> {
    if address > MAX_MEMORY_ADDRESS || size == 0 {
        return Err(DiagError::ParameterInvalid);
    }
    Ok([
        KwpCommand::ReadMemoryByAddress.into(),
        (address >> 16) as u8,
        (address >> 8) as u8,
        address as u8,
        size,
    ])
}

impl KwpClient {
    /// Reads `size` bytes of memory on the ECU from a 3 byte address
    pub fn kwp_read_memory(&mut self, address: u32, size: u8) -> DiagResult<Vec<u8>> {
        let mut res = self.request(&read_memory_request(address, size)?)?;
        res.remove(0);
        if res.len() != size as usize {
            log::warn!(
                "Read of 0x{address:06X} returned {} bytes, expected {size}",
                res.len()
            );
            return Err(DiagError::InvalidResponseLength);
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        assert_eq!(
            read_memory_request(0x020100, 0x80).unwrap(),
            [0x23, 0x02, 0x01, 0x00, 0x80]
        );
        assert!(read_memory_request(0x1000000, 0x80).is_err());
        assert!(read_memory_request(0, 0).is_err());
    }
}
