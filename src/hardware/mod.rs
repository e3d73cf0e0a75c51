//! Frame channel implementations
//!
//! * [simulation] - An in-process ECU which speaks the segmented transport, used to exercise
//!   the workflows without hardware
//! * `socketcan` - Linux SocketCAN interfaces (Requires the `socketcan` feature)

pub mod simulation;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
pub mod socketcan;
