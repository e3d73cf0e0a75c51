use strum_macros::Display;

/// KWP2000 negative response codes, with their human readable reasons
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum KwpNrc {
    /// ECU rejected the request for unknown reason
    #[strum(to_string = "General reject")]
    GeneralReject,
    /// ECU Does not support the requested service
    #[strum(to_string = "Service not supported")]
    ServiceNotSupported,
    /// ECU does not support arguments provided, or message format is incorrect
    #[strum(to_string = "Sub-function not supported or invalid format")]
    SubFunctionNotSupportedInvalidFormat,
    /// ECU is too busy to perform the request
    #[strum(to_string = "Busy, repeat request")]
    BusyRepeatRequest,
    /// ECU prerequisite conditions are not met
    #[strum(to_string = "Conditions not correct or request sequence error")]
    ConditionsNotCorrectRequestSequenceError,
    /// Requested results of a routine that is not completed
    #[strum(to_string = "Routine not complete")]
    RoutineNotComplete,
    /// The request message contains data which is out of range
    #[strum(to_string = "Request out of range")]
    RequestOutOfRange,
    /// Security access is denied
    #[strum(to_string = "Security access denied")]
    SecurityAccessDenied,
    /// Invalid key provided to the ECU
    #[strum(to_string = "Invalid key")]
    InvalidKey,
    /// Exceeded the number of incorrect security access attempts
    #[strum(to_string = "Exceeded number of security access attempts")]
    ExceedNumberOfAttempts,
    /// Time period for requesting a new seed not expired
    #[strum(to_string = "Required time delay not expired")]
    RequiredTimeDelayNotExpired,
    /// ECU fault prevents data download
    #[strum(to_string = "Download not accepted")]
    DownloadNotAccepted,
    /// ECU fault prevents data upload
    #[strum(to_string = "Upload not accepted")]
    UploadNotAccepted,
    /// ECU fault has stopped the transfer of data
    #[strum(to_string = "Transfer suspended")]
    TransferSuspended,
    /// Erasing or programming flash failed
    #[strum(to_string = "General programming failure")]
    GeneralProgrammingFailure,
    /// Block sequence counter of a transfer was wrong
    #[strum(to_string = "Wrong block sequence counter")]
    WrongBlockSequenceCounter,
    /// Transfer address is outside the programmable range
    #[strum(to_string = "Illegal address in block transfer")]
    IllegalAddressInBlockTransfer,
    /// Transfer size does not match the announced download
    #[strum(to_string = "Illegal byte count in block transfer")]
    IllegalByteCountInBlockTransfer,
    /// Transfer mode is not supported
    #[strum(to_string = "Illegal block transfer type")]
    IllegalBlockTransferType,
    /// Transferred data failed its checksum
    #[strum(to_string = "Block transfer data checksum error")]
    BlockTransferDataChecksumError,
    /// The ECU has accepted the request, but cannot reply right now
    #[strum(to_string = "Request correctly received, response pending")]
    RequestCorrectlyReceivedResponsePending,
    /// Byte count of the transfer was wrong
    #[strum(to_string = "Incorrect byte count during block transfer")]
    IncorrectByteCountDuringBlockTransfer,
    /// Requested service is not supported in the current diagnostic session mode
    #[strum(to_string = "Service not supported in active diagnostic session")]
    ServiceNotSupportedInActiveSession,
    /// Data decompression failed
    #[strum(to_string = "Data decompression failed")]
    DataDecompressionFailed,
    /// Data decryption failed
    #[strum(to_string = "Data decryption failed")]
    DataDecryptionFailed,
    /// Sent by a gateway ECU. The requested ECU behind the gateway is not responding
    #[strum(to_string = "ECU not responding")]
    EcuNotResponding,
    /// Sent by a gateway ECU. The requested ECU address is unknown
    #[strum(to_string = "ECU address unknown")]
    EcuAddressUnknown,
    /// Manufacturer specific code
    #[strum(to_string = "Manufacturer specific error")]
    ManufacturerSpecific,
    /// Reserved for future ISO14230 use
    #[strum(to_string = "Reserved error code")]
    ReservedISO,
}

impl From<u8> for KwpNrc {
    fn from(p: u8) -> Self {
        match p {
            0x10 => Self::GeneralReject,
            0x11 => Self::ServiceNotSupported,
            0x12 => Self::SubFunctionNotSupportedInvalidFormat,
            0x21 => Self::BusyRepeatRequest,
            0x22 => Self::ConditionsNotCorrectRequestSequenceError,
            0x23 => Self::RoutineNotComplete,
            0x31 => Self::RequestOutOfRange,
            0x33 => Self::SecurityAccessDenied,
            0x35 => Self::InvalidKey,
            0x36 => Self::ExceedNumberOfAttempts,
            0x37 => Self::RequiredTimeDelayNotExpired,
            0x40 => Self::DownloadNotAccepted,
            0x50 => Self::UploadNotAccepted,
            0x71 => Self::TransferSuspended,
            0x72 => Self::GeneralProgrammingFailure,
            0x73 => Self::WrongBlockSequenceCounter,
            0x74 => Self::IllegalAddressInBlockTransfer,
            0x75 => Self::IllegalByteCountInBlockTransfer,
            0x76 => Self::IllegalBlockTransferType,
            0x77 => Self::BlockTransferDataChecksumError,
            0x78 => Self::RequestCorrectlyReceivedResponsePending,
            0x79 => Self::IncorrectByteCountDuringBlockTransfer,
            0x80 => Self::ServiceNotSupportedInActiveSession,
            0x9A => Self::DataDecompressionFailed,
            0x9B => Self::DataDecryptionFailed,
            0xA0 => Self::EcuNotResponding,
            0xA1 => Self::EcuAddressUnknown,
            0x90..=0xF9 => Self::ManufacturerSpecific,
            _ => Self::ReservedISO,
        }
    }
}

impl KwpNrc {
    /// The ECU will answer later, keep waiting
    pub fn is_response_pending(&self) -> bool {
        *self == KwpNrc::RequestCorrectlyReceivedResponsePending
    }

    /// The ECU wants the same request sent again
    pub fn is_busy_repeat(&self) -> bool {
        *self == KwpNrc::BusyRepeatRequest
    }

    /// Security access is locked out for this session
    pub fn is_attempts_exceeded(&self) -> bool {
        *self == KwpNrc::ExceedNumberOfAttempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_are_readable() {
        assert_eq!(KwpNrc::from(0x72).to_string(), "General programming failure");
        assert_eq!(KwpNrc::from(0x21).to_string(), "Busy, repeat request");
        assert!(KwpNrc::from(0x78).is_response_pending());
        assert!(KwpNrc::from(0x36).is_attempts_exceeded());
        assert_eq!(KwpNrc::from(0x95), KwpNrc::ManufacturerSpecific);
        assert_eq!(KwpNrc::from(0xFE), KwpNrc::ReservedISO);
    }
}
