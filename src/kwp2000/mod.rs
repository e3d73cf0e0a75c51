//! Module for KWP2000 (Keyword protocol 2000 - ISO14230) over the segmented CAN transport
//!
//! [KwpClient] is the request/response engine. Every service wrapper in this module is an
//! `impl KwpClient` block, and all of them share the same rules for handling the ECU's reply:
//!
//! * A positive response (request SID + 0x40) is returned to the caller
//! * `0x7F <sid> 0x78` (response pending) extends the read timeout by the policy multiplier
//! * `0x7F <sid> 0x21` (busy, repeat request) re-sends the request after a short delay
//! * Any other negative response becomes [DiagError::NegativeResponse]
//! * A sequence error flushes the inbox and re-sends the whole request
//!
//! Every retry is bounded by [ResponsePolicy].

use std::time::Duration;

use crate::{segmented::SegmentedCodec, DiagError, DiagResult};

mod data_transfer;
mod ecu_reset;
mod error;
mod message_transmission;
mod read_ecu_identification;
mod read_memory_by_address;
mod routine;
mod security_access;
mod start_diagnostic_session;
mod write_data_by_local_id;

pub use data_transfer::*;
pub use ecu_reset::*;
pub use error::*;
pub use read_memory_by_address::*;
pub use routine::*;
pub use security_access::*;
pub use start_diagnostic_session::*;

/// Negative response service ID
pub const NEGATIVE_RESPONSE: u8 = 0x7F;
/// Positive responses are the request SID plus this offset
pub const POSITIVE_OFFSET: u8 = 0x40;

/// KWP Command Service IDs used by the flasher.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum KwpCommand {
    /// Start or change ECU diagnostic session mode
    StartDiagnosticSession,
    /// Reset the ECU
    ECUReset,
    /// Reads ECU identification data
    ReadECUIdentification,
    /// Reads memory from the ECU by address
    ReadMemoryByAddress,
    /// Security access functions
    SecurityAccess,
    /// Disables normal CAN message transmission from an ECU
    DisableNormalMessageTransmission,
    /// Starts a ECU routine given a local identifier
    StartRoutineByLocalIdentifier,
    /// Announces a download to the ECU
    RequestDownload,
    /// Transfers a block of a download
    TransferData,
    /// Ends a download
    RequestTransferExit,
    /// Writes data to a local identifier
    WriteDataByLocalIdentifier,
    /// Tester present message
    TesterPresent,
    /// Custom KWP2000 SID not part of the official specification
    CustomSid(u8),
}

impl From<u8> for KwpCommand {
    fn from(sid: u8) -> Self {
        match sid {
            0x10 => KwpCommand::StartDiagnosticSession,
            0x11 => KwpCommand::ECUReset,
            0x1A => KwpCommand::ReadECUIdentification,
            0x23 => KwpCommand::ReadMemoryByAddress,
            0x27 => KwpCommand::SecurityAccess,
            0x28 => KwpCommand::DisableNormalMessageTransmission,
            0x31 => KwpCommand::StartRoutineByLocalIdentifier,
            0x34 => KwpCommand::RequestDownload,
            0x36 => KwpCommand::TransferData,
            0x37 => KwpCommand::RequestTransferExit,
            0x3B => KwpCommand::WriteDataByLocalIdentifier,
            0x3E => KwpCommand::TesterPresent,
            s => KwpCommand::CustomSid(s),
        }
    }
}

impl From<KwpCommand> for u8 {
    fn from(cmd: KwpCommand) -> Self {
        match cmd {
            KwpCommand::StartDiagnosticSession => 0x10,
            KwpCommand::ECUReset => 0x11,
            KwpCommand::ReadECUIdentification => 0x1A,
            KwpCommand::ReadMemoryByAddress => 0x23,
            KwpCommand::SecurityAccess => 0x27,
            KwpCommand::DisableNormalMessageTransmission => 0x28,
            KwpCommand::StartRoutineByLocalIdentifier => 0x31,
            KwpCommand::RequestDownload => 0x34,
            KwpCommand::TransferData => 0x36,
            KwpCommand::RequestTransferExit => 0x37,
            KwpCommand::WriteDataByLocalIdentifier => 0x3B,
            KwpCommand::TesterPresent => 0x3E,
            KwpCommand::CustomSid(s) => s,
        }
    }
}

/// Tester present request which asks the ECU not to answer
pub const TESTER_PRESENT_NO_RESPONSE: [u8; 2] = [0x3E, 0x02];

/// Retry and timeout policy applied to every request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResponsePolicy {
    /// Time to wait for each response frame
    pub read_timeout: Duration,
    /// Factor the read timeout grows by on every 'response pending'
    pub pending_multiplier: u32,
    /// Maximum number of 'response pending' replies tolerated for one request
    pub max_pending_extensions: u32,
    /// Maximum number of re-sends after 'busy, repeat request'
    pub busy_retries: u32,
    /// Delay before re-sending after 'busy, repeat request'
    pub busy_delay: Duration,
    /// Maximum number of re-sends after a sequence error
    pub sequence_retries: u32,
}

impl Default for ResponsePolicy {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(1000),
            pending_multiplier: 2,
            max_pending_extensions: 8,
            busy_retries: 5,
            busy_delay: Duration::from_millis(100),
            sequence_retries: 2,
        }
    }
}

/// Interpretation of a single ECU reply to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Positive response to the request
    Positive(Vec<u8>),
    /// Request received, the real answer follows later
    Pending,
    /// ECU asks for the request to be repeated
    Busy,
    /// ECU refused the request
    Negative(u8),
    /// Reply belongs to some other request
    Unrelated(Vec<u8>),
}

/// Classifies a reply against the SID of the request it should answer
pub fn classify_reply(sid: u8, resp: Vec<u8>) -> Reply {
    match resp.as_slice() {
        [NEGATIVE_RESPONSE, service, code, ..] if *service == sid => {
            let nrc = KwpNrc::from(*code);
            if nrc.is_response_pending() {
                Reply::Pending
            } else if nrc.is_busy_repeat() {
                Reply::Busy
            } else {
                Reply::Negative(*code)
            }
        }
        [first, ..] if *first == sid.wrapping_add(POSITIVE_OFFSET) => Reply::Positive(resp),
        _ => Reply::Unrelated(resp),
    }
}

pub(crate) fn negative_response(service: u8, code: u8) -> DiagError {
    DiagError::NegativeResponse {
        service,
        code,
        reason: KwpNrc::from(code).to_string(),
    }
}

const MAX_UNRELATED_REPLIES: u32 = 16;

/// KWP2000 request/response engine over a [SegmentedCodec]
#[derive(Debug)]
pub struct KwpClient {
    codec: SegmentedCodec,
    policy: ResponsePolicy,
}

impl KwpClient {
    /// Creates a new client
    pub fn new(codec: SegmentedCodec, policy: ResponsePolicy) -> Self {
        Self { codec, policy }
    }

    /// Retry and timeout policy
    pub fn policy(&self) -> &ResponsePolicy {
        &self.policy
    }

    /// Underlying codec
    pub fn codec(&mut self) -> &mut SegmentedCodec {
        &mut self.codec
    }

    /// Discards any frame still queued from earlier traffic
    pub fn flush(&self) {
        self.codec.listener().flush()
    }

    /// Sends a request which has no response
    pub fn send_only(&mut self, payload: &[u8]) -> DiagResult<()> {
        self.flush();
        self.codec.send(payload)
    }

    /// Waits for the next message from the ECU, without interpreting it
    pub fn receive_raw(&mut self, timeout: Duration) -> DiagResult<Vec<u8>> {
        self.codec.receive(timeout)
    }

    /// Sends a command and awaits the positive response
    pub fn send_command<T: Into<u8>>(&mut self, cmd: T, args: &[u8]) -> DiagResult<Vec<u8>> {
        let mut r = vec![cmd.into()];
        r.extend_from_slice(args);
        self.request(&r)
    }

    /// Sends a raw request and awaits the positive response
    pub fn request(&mut self, payload: &[u8]) -> DiagResult<Vec<u8>> {
        let timeout = self.policy.read_timeout;
        self.request_with_timeout(payload, timeout)
    }

    /// Sends a raw request and awaits the positive response, using a custom initial read timeout
    pub fn request_with_timeout(
        &mut self,
        payload: &[u8],
        timeout: Duration,
    ) -> DiagResult<Vec<u8>> {
        let sid = *payload.first().ok_or(DiagError::ParameterInvalid)?;
        let mut sequence_attempts = 0;
        let mut busy_attempts = 0;
        'send: loop {
            self.flush();
            self.codec.send(payload)?;
            let mut read_timeout = timeout;
            let mut extensions = 0;
            let mut unrelated = 0;
            loop {
                let resp = match self.codec.receive(read_timeout) {
                    Ok(r) => r,
                    Err(DiagError::Sequence { .. })
                        if sequence_attempts < self.policy.sequence_retries =>
                    {
                        sequence_attempts += 1;
                        log::warn!(
                            "Sequence error, re-sending request 0x{sid:02X} ({sequence_attempts})"
                        );
                        continue 'send;
                    }
                    Err(e) => return Err(e),
                };
                match classify_reply(sid, resp) {
                    Reply::Positive(r) => {
                        log::debug!("ECU positive response {r:02X?}");
                        return Ok(r);
                    }
                    Reply::Pending => {
                        if extensions >= self.policy.max_pending_extensions {
                            log::error!(
                                "ECU still pending after {extensions} extensions, giving up"
                            );
                            return Err(negative_response(sid, 0x78));
                        }
                        extensions += 1;
                        read_timeout =
                            read_timeout.saturating_mul(self.policy.pending_multiplier.max(1));
                        log::debug!("ECU response pending, waiting up to {read_timeout:?}");
                    }
                    Reply::Busy => {
                        if busy_attempts >= self.policy.busy_retries {
                            return Err(negative_response(sid, 0x21));
                        }
                        busy_attempts += 1;
                        log::warn!(
                            "ECU busy, repeating request 0x{sid:02X} in {:?}",
                            self.policy.busy_delay
                        );
                        std::thread::sleep(self.policy.busy_delay);
                        continue 'send;
                    }
                    Reply::Negative(code) => {
                        let e = negative_response(sid, code);
                        log::warn!("{e}");
                        return Err(e);
                    }
                    Reply::Unrelated(r) => {
                        unrelated += 1;
                        log::debug!("Ignoring unrelated response {r:02X?}");
                        if unrelated > MAX_UNRELATED_REPLIES {
                            return Err(DiagError::WrongMessage);
                        }
                    }
                }
            }
        }
    }

    /// Sends a tester present which the ECU does not answer
    pub fn kwp_tester_present(&mut self) -> DiagResult<()> {
        self.codec.send(&TESTER_PRESENT_NO_RESPONSE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify() {
        assert_eq!(
            classify_reply(0x27, vec![0x67, 0x01, 0x12, 0x34]),
            Reply::Positive(vec![0x67, 0x01, 0x12, 0x34])
        );
        assert_eq!(classify_reply(0x31, vec![0x7F, 0x31, 0x78]), Reply::Pending);
        assert_eq!(classify_reply(0x31, vec![0x7F, 0x31, 0x21]), Reply::Busy);
        assert_eq!(classify_reply(0x31, vec![0x7F, 0x31, 0x72]), Reply::Negative(0x72));
        assert_eq!(
            classify_reply(0x31, vec![0x7F, 0x36, 0x72]),
            Reply::Unrelated(vec![0x7F, 0x36, 0x72])
        );
        assert_eq!(classify_reply(0x31, vec![0x7E]), Reply::Unrelated(vec![0x7E]));
    }

    #[test]
    fn command_bytes() {
        for sid in [
            0x10u8, 0x11, 0x1A, 0x23, 0x27, 0x28, 0x31, 0x34, 0x36, 0x37, 0x3B, 0x3E, 0xAA,
        ] {
            assert_eq!(u8::from(KwpCommand::from(sid)), sid);
        }
    }
}
