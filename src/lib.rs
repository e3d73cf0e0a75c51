#![warn(
    missing_docs,
    missing_debug_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate for authenticating to, reprogramming and recovering engine control units
//! which speak a KWP2000 style protocol over a segmented CAN transport.
//!
//! ## Layers
//!
//! The crate is split into the same layers a flash tool talks through:
//!
//! * [channel] - A raw CAN [channel::FrameChannel]. Adapter drivers implement this trait,
//!   and describe their quirks through [channel::AdapterCapabilities] rather than being type checked.
//! * [listener] - A bounded inbox with a `wait_for(ids, timeout)` rendezvous, armed before every request.
//! * [segmented] - The segmented message codec (single frame, first frame, flow control and
//!   consecutive frames with a wrapping 4 bit sequence counter).
//! * [kwp2000] - KWP2000 services and the request/response engine which deals with
//!   response pending, busy-repeat and negative responses.
//! * [session] - Diagnostic session state, seed/key security access and the tester present keep-alive.
//! * [firmware] - Firmware images, coded transfer blocks and partition tables.
//! * [flash] - The erase, program and verify workflows, plus the recovery and read-back variants.
//!
//! ## ECU families
//!
//! Two families of ECU are supported:
//!
//! * Block coded (Trionic 8, with or without MCP) - Flash is written in fixed size blocks, each
//!   transformed with a short keystream which is reset at the start of every block.
//! * Partitioned (ME9.6, E39) - Flash is erased, written and verified per partition, with verification
//!   done by comparing digests computed on both sides.

pub mod channel;
pub mod config;
pub mod did_file;
pub mod firmware;
pub mod flash;
pub mod hardware;
pub mod kwp2000;
pub mod listener;
pub mod progress;
pub mod segmented;
pub mod session;

use channel::ChannelError;

/// Diagnostic transport result
pub type DiagResult<T> = Result<T, DiagError>;

#[derive(Debug, thiserror::Error)]
/// Error produced by the transport and KWP2000 layers
pub enum DiagError {
    /// Error with the underlying frame channel
    #[error("Frame channel error: {0}")]
    Transport(
        #[from]
        #[source]
        ChannelError,
    ),
    /// No frame arrived within the allowed time
    #[error("ECU did not respond in time")]
    Timeout,
    /// A frame was received that could not be interpreted
    #[error("Malformed frame received from ECU")]
    MalformedFrame,
    /// A consecutive frame carried the wrong sequence counter
    #[error(
        "Consecutive frame out of sequence. Expected 0x{:02X}, received 0x{:02X}",
        expected,
        received
    )]
    Sequence {
        /// Expected PCI byte (0x20-0x2F)
        expected: u8,
        /// Received PCI byte
        received: u8,
    },
    /// ECU rejected our first frame with an overflow, or asked for an unsupported block size
    #[error("ECU rejected the segmented transfer")]
    FlowControlRejected,
    /// Payload is too large to be segmented (Limit is 4095 bytes)
    #[error("Message of {0} bytes is too long for the segmented transport")]
    MessageTooLong(usize),
    /// ECU explicitly refused the request
    #[error("ECU negative response to service 0x{:02X}. Error 0x{:02X}: {}", service, code, reason)]
    NegativeResponse {
        /// Service ID which was rejected
        service: u8,
        /// Raw negative response code
        code: u8,
        /// Human readable reason
        reason: String,
    },
    /// ECU responded, but with a reply for a different service
    #[error("ECU response is out of order")]
    WrongMessage,
    /// ECU responded, but the length of the response was not correct
    #[error("ECU response size was not the correct length")]
    InvalidResponseLength,
    /// A parameter given to the function is invalid
    #[error("Diagnostic function parameter invalid")]
    ParameterInvalid,
    /// The request is not allowed from the current session state
    #[error("Request not allowed in session state {0}")]
    InvalidState(String),
}

impl DiagError {
    /// Returns the negative response code, if this error was an ECU refusal
    pub fn nrc(&self) -> Option<u8> {
        match self {
            DiagError::NegativeResponse { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True for errors the calling layer may retry locally
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DiagError::Timeout
                | DiagError::Transport(_)
                | DiagError::Sequence { .. }
                | DiagError::MalformedFrame
                | DiagError::WrongMessage
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_carries_channel_reason() {
        let e = DiagError::from(ChannelError::InterfaceNotOpen);
        assert_eq!(
            e.to_string(),
            "Frame channel error: channel's interface is not open"
        );
        assert!(e.is_recoverable());
        assert_eq!(e.nrc(), None);
    }
}
