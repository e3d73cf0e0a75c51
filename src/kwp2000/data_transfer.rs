//! Download, transfer and execute services used to program the ECU

use super::{KwpClient, KwpCommand};
use crate::{DiagError, DiagResult};

/// Largest transfer request the segmented transport is asked to carry
pub const MAX_TRANSFER_REQUEST: usize = 0xF0;
/// Size of the transfer request header (SID, mode, 4 byte address)
pub const TRANSFER_HEADER_LEN: usize = 6;
/// Largest data payload of one transfer request
pub const MAX_TRANSFER_DATA: usize = MAX_TRANSFER_REQUEST - TRANSFER_HEADER_LEN;

/// Transfer data sub-function
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferMode {
    /// Write the data at the address
    Download,
    /// Jump to the address
    Execute,
}

impl From<TransferMode> for u8 {
    fn from(m: TransferMode) -> Self {
        match m {
            TransferMode::Download => 0x00,
            TransferMode::Execute => 0x80,
        }
    }
}

/// Builds a request download message for `len` bytes at `address` (both 24 bit)
pub fn request_download_request(address: u32, len: u32) -> DiagResult<[u8; 8]> {
    if address > 0xFFFFFF || len > 0xFFFFFF {
        return Err(DiagError::ParameterInvalid);
    }
    Ok([
        KwpCommand::RequestDownload.into(),
        0x00,
        (address >> 16) as u8,
        (address >> 8) as u8,
        address as u8,
        (len >> 16) as u8,
        (len >> 8) as u8,
        len as u8,
    ])
}

/// Builds a transfer data message: `36 <mode> <address BE> <data>`
pub fn transfer_request(mode: TransferMode, address: u32, data: &[u8]) -> DiagResult<Vec<u8>> {
    if data.len() > MAX_TRANSFER_DATA {
        return Err(DiagError::ParameterInvalid);
    }
    let mut r = Vec::with_capacity(TRANSFER_HEADER_LEN + data.len());
    r.push(KwpCommand::TransferData.into());
    r.push(mode.into());
    r.extend_from_slice(&address.to_be_bytes());
    r.extend_from_slice(data);
    Ok(r)
}

impl KwpClient {
    /// Announces a download of `len` bytes to `address`
    pub fn kwp_request_download(&mut self, address: u32, len: u32) -> DiagResult<()> {
        self.request(&request_download_request(address, len)?)?;
        Ok(())
    }

    /// Transfers data to `address`, as part of a download announced earlier
    pub fn kwp_transfer_data(&mut self, address: u32, data: &[u8]) -> DiagResult<()> {
        self.request(&transfer_request(TransferMode::Download, address, data)?)?;
        Ok(())
    }

    /// Sends an already built transfer data request
    pub fn kwp_transfer_raw(&mut self, request: &[u8]) -> DiagResult<()> {
        if request.first() != Some(&u8::from(KwpCommand::TransferData)) {
            return Err(DiagError::ParameterInvalid);
        }
        self.request(request)?;
        Ok(())
    }

    /// Starts execution of previously downloaded code at `address`
    pub fn kwp_execute(&mut self, address: u32) -> DiagResult<()> {
        self.request(&transfer_request(TransferMode::Execute, address, &[])?)?;
        Ok(())
    }

    /// Ends the current download
    pub fn kwp_transfer_exit(&mut self) -> DiagResult<()> {
        self.send_command(KwpCommand::RequestTransferExit, &[])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layouts() {
        assert_eq!(
            request_download_request(0x102400, 0x0EA).unwrap(),
            [0x34, 0x00, 0x10, 0x24, 0x00, 0x00, 0x00, 0xEA]
        );
        let t = transfer_request(TransferMode::Download, 0x020000, &[0xAA; 4]).unwrap();
        assert_eq!(t, [0x36, 0x00, 0x00, 0x02, 0x00, 0x00, 0xAA, 0xAA, 0xAA, 0xAA]);
        let e = transfer_request(TransferMode::Execute, 0x102460, &[]).unwrap();
        assert_eq!(e, [0x36, 0x80, 0x00, 0x10, 0x24, 0x60]);
        assert!(transfer_request(TransferMode::Download, 0, &[0; MAX_TRANSFER_DATA + 1]).is_err());
    }
}
