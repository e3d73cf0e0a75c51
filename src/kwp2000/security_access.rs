//! Functions for unlocking secure regions on the ECU

use strum_macros::{Display, EnumString};

use super::{KwpClient, KwpCommand};
use crate::{DiagError, DiagResult};

/// Security access levels understood by the ECU families this crate flashes
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, EnumString)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SecurityLevel {
    /// Default access, no seed/key exchange
    #[strum(serialize = "public")]
    Public,
    /// Level 0x01, required for bootloader upload
    #[strum(serialize = "01")]
    Level01,
    /// Level 0xFB, used by the uploaded bootloader
    #[strum(serialize = "FB")]
    LevelFB,
    /// Level 0xFD, alternative bootloader level
    #[strum(serialize = "FD")]
    LevelFD,
}

impl SecurityLevel {
    /// Sub-function byte of the seed request. [SecurityLevel::Public] has none
    pub fn seed_request(&self) -> Option<u8> {
        match self {
            SecurityLevel::Public => None,
            SecurityLevel::Level01 => Some(0x01),
            SecurityLevel::LevelFB => Some(0xFB),
            SecurityLevel::LevelFD => Some(0xFD),
        }
    }

    /// Sub-function byte of the key submission
    pub fn key_submit(&self) -> Option<u8> {
        self.seed_request().map(|s| s.wrapping_add(1))
    }

    /// Codes the ECU may echo in a positive key response to mean 'access granted'.
    ///
    /// Bootloader levels answer with either of the two bootloader key codes.
    pub fn granted_codes(&self) -> &'static [u8] {
        match self {
            SecurityLevel::Public => &[],
            SecurityLevel::Level01 => &[0x02],
            SecurityLevel::LevelFB => &[0xFC, 0xFE],
            SecurityLevel::LevelFD => &[0xFE, 0xFC],
        }
    }

    /// True if `code` means access was granted at this level
    pub fn is_granted_code(&self, code: u8) -> bool {
        self.granted_codes().contains(&code)
    }
}

impl KwpClient {
    /// Requests a seed from the ECU
    ///
    /// ## Returns
    /// The 2 byte seed. A seed of `[0x00, 0x00]` means the level is already unlocked
    pub fn kwp_request_seed(&mut self, level: SecurityLevel) -> DiagResult<[u8; 2]> {
        let mode = level.seed_request().ok_or(DiagError::ParameterInvalid)?;
        let res = self.send_command(KwpCommand::SecurityAccess, &[mode])?;
        match res.as_slice() {
            [_, echo, s0, s1, ..] if *echo == mode => Ok([*s0, *s1]),
            [_, _, _, _, ..] => Err(DiagError::WrongMessage),
            _ => Err(DiagError::InvalidResponseLength),
        }
    }

    /// Submits the key computed from the seed of [KwpClient::kwp_request_seed].
    ///
    /// ## Returns
    /// True if the positive response carries one of the level's granted codes
    pub fn kwp_send_key(&mut self, level: SecurityLevel, key: [u8; 2]) -> DiagResult<bool> {
        let mode = level.key_submit().ok_or(DiagError::ParameterInvalid)?;
        let res = self.send_command(KwpCommand::SecurityAccess, &[mode, key[0], key[1]])?;
        let code = *res.get(1).ok_or(DiagError::InvalidResponseLength)?;
        if !level.is_granted_code(code) {
            log::warn!("Key response code 0x{code:02X} is not a grant for level {level}");
        }
        Ok(level.is_granted_code(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn level_bytes_and_grants() {
        assert_eq!(SecurityLevel::Level01.key_submit(), Some(0x02));
        assert_eq!(SecurityLevel::LevelFB.key_submit(), Some(0xFC));
        assert!(SecurityLevel::LevelFB.is_granted_code(0xFE));
        assert!(SecurityLevel::LevelFD.is_granted_code(0xFC));
        assert!(!SecurityLevel::Level01.is_granted_code(0xFE));
        assert_eq!(SecurityLevel::Public.seed_request(), None);
        assert_eq!(SecurityLevel::from_str("FB").unwrap(), SecurityLevel::LevelFB);
        assert_eq!(SecurityLevel::Level01.to_string(), "01");
    }
}
