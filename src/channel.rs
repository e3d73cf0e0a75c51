//! Module for the raw CAN channel to an ECU
//!
//! The protocol layers only need four things from an adapter, which is what [FrameChannel] defines:
//! * Opening and closing the interface
//! * Sending a single [CanFrame]
//! * Delivering inbound frames through a callback
//! * Restricting which identifiers are delivered
//!
//! Adapter specific behaviour (Automatic flow control, response count hints for
//! high latency adapters) is described with [AdapterQuirks] through [AdapterCapabilities].

use std::sync::Arc;

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug)]
/// Error produced by a communication channel
pub enum ChannelError {
    /// Underlying IO Error with channel
    IOError(std::io::Error),
    /// The adapter refused or failed to transmit the frame
    WriteFailed,
    /// The interface is not open
    InterfaceNotOpen,
    /// Unsupported channel request
    UnsupportedRequest,
    /// Frame could not be represented on this channel
    InvalidFrame,
    /// Underlying API error with hardware
    APIError {
        /// Name of the API EG: 'socketCAN'
        api_name: String,
        /// Internal API error code
        code: u8,
        /// API error description
        desc: String,
    },
    /// Other channel error
    Other(String),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::IOError(e) => write!(f, "IO error: {e}"),
            ChannelError::WriteFailed => write!(f, "adapter failed to transmit frame"),
            ChannelError::InterfaceNotOpen => write!(f, "channel's interface is not open"),
            ChannelError::UnsupportedRequest => write!(f, "unsupported channel request"),
            ChannelError::InvalidFrame => write!(f, "frame is not valid for this channel"),
            ChannelError::APIError {
                api_name,
                code,
                desc,
            } => write!(f, "underlying {api_name} API error ({code}): {desc}"),
            ChannelError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Self::IOError(io_err) = self {
            Some(io_err)
        } else {
            None
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        Self::IOError(e)
    }
}

/// A single CAN frame (11bit identifier, up to 8 bytes of data)
///
/// Frames are immutable once built. The optional response hint tells latency constrained
/// adapters how many frames to expect in reply, it is never put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    dlc: u8,
    data: [u8; 8],
    response_hint: Option<u8>,
}

impl CanFrame {
    /// Creates a new frame. Data beyond 8 bytes is truncated
    pub fn new(id: u32, data: &[u8]) -> Self {
        let dlc = data.len().min(8);
        let mut buf = [0u8; 8];
        buf[..dlc].copy_from_slice(&data[..dlc]);
        Self {
            id,
            dlc: dlc as u8,
            data: buf,
            response_hint: None,
        }
    }

    /// Attaches an expected reply count hint to the frame
    pub fn with_response_hint(mut self, replies: u8) -> Self {
        self.response_hint = Some(replies);
        self
    }

    /// Identifier of the frame
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Data bytes of the frame
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// Expected reply count hint, if one was attached
    pub fn response_hint(&self) -> Option<u8> {
        self.response_hint
    }

    /// True if the frame carries no data, or only zero bytes.
    /// Some adapters hand these up while the ECU has not answered yet
    pub fn is_zeroed(&self) -> bool {
        self.data().iter().all(|b| *b == 0)
    }
}

/// Callback used by a [FrameChannel] to hand inbound frames to the protocol layers
pub type FrameCallback = Arc<dyn Fn(CanFrame) + Send + Sync>;

bitflags::bitflags! {
    /// Adapter specific behaviour the core needs to know about
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AdapterQuirks: u8 {
        /// Adapter answers first frames with flow control itself
        const AUTO_FLOW_CONTROL = 0b0000_0001;
        /// Adapter wants the number of expected reply frames attached to each transmitted frame
        const RESPONSE_COUNT_HINT = 0b0000_0010;
    }
}

/// Capability queries used by the protocol layers instead of checking the adapter type
pub trait AdapterCapabilities {
    /// Quirks of this adapter
    fn quirks(&self) -> AdapterQuirks {
        AdapterQuirks::empty()
    }

    /// True if the adapter sends flow control frames on our behalf when the ECU starts
    /// a segmented response, so the codec must not send its own
    fn supports_flow_control_bypass(&self) -> bool {
        self.quirks().contains(AdapterQuirks::AUTO_FLOW_CONTROL)
    }

    /// Returns the hint to attach to a frame which expects `replies` frames in return
    fn expected_response_count_hint(&self, replies: u8) -> Option<u8> {
        if self.quirks().contains(AdapterQuirks::RESPONSE_COUNT_HINT) {
            Some(replies)
        } else {
            None
        }
    }
}

/// Raw CAN channel implemented by an adapter driver
pub trait FrameChannel: AdapterCapabilities + Send + Sync {
    /// Opens the interface
    fn open(&self) -> ChannelResult<()>;

    /// Closes the interface
    fn close(&self) -> ChannelResult<()>;

    /// Transmits a single frame
    fn send(&self, frame: &CanFrame) -> ChannelResult<()>;

    /// Registers the callback inbound frames are delivered to. Replaces any previous callback
    fn set_rx_callback(&self, callback: FrameCallback) -> ChannelResult<()>;

    /// Restricts inbound delivery to the given identifiers. An empty list delivers everything
    fn set_allowed_ids(&self, ids: &[u32]) -> ChannelResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;
    impl AdapterCapabilities for Plain {}

    struct Elm;
    impl AdapterCapabilities for Elm {
        fn quirks(&self) -> AdapterQuirks {
            AdapterQuirks::AUTO_FLOW_CONTROL | AdapterQuirks::RESPONSE_COUNT_HINT
        }
    }

    #[test]
    fn frame_truncates_and_reports_zeroed() {
        let f = CanFrame::new(0x7E8, &[0; 10]);
        assert_eq!(f.data().len(), 8);
        assert!(f.is_zeroed());
        let f = CanFrame::new(0x7E8, &[0x02, 0x50, 0x92]);
        assert_eq!(f.data(), &[0x02, 0x50, 0x92]);
        assert!(!f.is_zeroed());
        assert_eq!(f.response_hint(), None);
        assert_eq!(f.with_response_hint(1).response_hint(), Some(1));
    }

    #[test]
    fn capabilities_follow_quirks() {
        assert!(!Plain.supports_flow_control_bypass());
        assert_eq!(Plain.expected_response_count_hint(1), None);
        assert!(Elm.supports_flow_control_bypass());
        assert_eq!(Elm.expected_response_count_hint(2), Some(2));
    }
}
