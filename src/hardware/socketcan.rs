//! SocketCAN module
//!
//! Raw CAN access through a Linux SocketCAN interface. A reader thread is started when the
//! channel is opened, and hands every frame with an allowed identifier to the registered callback.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::JoinHandle,
    time::Duration,
};

use socketcan::{CanSocket, EmbeddedFrame, Id, Socket, StandardId};

use crate::channel::{
    AdapterCapabilities, CanFrame, ChannelError, ChannelResult, FrameCallback, FrameChannel,
};

const READ_TIMEOUT: Duration = Duration::from_millis(20);

fn api_error(code: u8, desc: impl Into<String>) -> ChannelError {
    ChannelError::APIError {
        api_name: "socketCAN".into(),
        code,
        desc: desc.into(),
    }
}

#[derive(Default)]
struct Shared {
    callback: Mutex<Option<FrameCallback>>,
    allowed: Mutex<Vec<u32>>,
}

impl Shared {
    fn deliver(&self, frame: CanFrame) {
        let allowed = self.allowed.lock().unwrap_or_else(PoisonError::into_inner);
        if !allowed.is_empty() && !allowed.contains(&frame.id()) {
            return;
        }
        drop(allowed);
        let cb = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(cb) = cb {
            cb(frame)
        }
    }
}

/// SocketCAN raw CAN channel
pub struct SocketCanChannel {
    if_name: String,
    socket: Mutex<Option<Arc<CanSocket>>>,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SocketCanChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketCanChannel")
            .field("if_name", &self.if_name)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl SocketCanChannel {
    /// Creates a channel on interface `if_name` (EG: 'can0'). Nothing is opened yet
    pub fn new(if_name: impl Into<String>) -> Self {
        Self {
            if_name: if_name.into(),
            socket: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
            shared: Arc::new(Shared::default()),
        }
    }

    /// True if the network interface exists
    pub fn is_connected(&self) -> bool {
        PathBuf::from(format!("/sys/class/net/{}", self.if_name)).exists()
    }

    fn reader_loop(socket: Arc<CanSocket>, running: Arc<AtomicBool>, shared: Arc<Shared>) {
        while running.load(Ordering::Relaxed) {
            match socket.read_frame() {
                Ok(frame) => {
                    // Only standard identifiers are used by the diagnostic protocols
                    if let Id::Standard(id) = frame.id() {
                        shared.deliver(CanFrame::new(id.as_raw() as u32, frame.data()));
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => {
                    log::error!("SocketCAN read failed, stopping reader: {e}");
                    running.store(false, Ordering::Relaxed);
                }
            }
        }
    }
}

impl AdapterCapabilities for SocketCanChannel {}

impl FrameChannel for SocketCanChannel {
    fn open(&self) -> ChannelResult<()> {
        let mut slot = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(()); // Already open!
        }
        let socket = CanSocket::open(&self.if_name)
            .map_err(|e| api_error(1, format!("Cannot open {}: {e}", self.if_name)))?;
        socket.set_read_timeout(READ_TIMEOUT)?;
        let socket = Arc::new(socket);
        self.running.store(true, Ordering::Relaxed);
        let (s, r, sh) = (socket.clone(), self.running.clone(), self.shared.clone());
        let handle = std::thread::Builder::new()
            .name(format!("socketcan-{}", self.if_name))
            .spawn(move || Self::reader_loop(s, r, sh))?;
        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        *slot = Some(socket);
        log::debug!("Opened SocketCAN interface {}", self.if_name);
        Ok(())
    }

    fn close(&self) -> ChannelResult<()> {
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if socket.is_none() {
            return Ok(());
        }
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            join_reader(handle, &self.if_name);
        }
        Ok(())
    }

    fn send(&self, frame: &CanFrame) -> ChannelResult<()> {
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ChannelError::InterfaceNotOpen)?;
        let id = u16::try_from(frame.id())
            .ok()
            .and_then(StandardId::new)
            .ok_or(ChannelError::InvalidFrame)?;
        let cf = socketcan::CanFrame::new(id, frame.data()).ok_or(ChannelError::InvalidFrame)?;
        socket.write_frame(&cf).map_err(|e| {
            log::warn!("SocketCAN write of 0x{:03X} failed: {e}", frame.id());
            ChannelError::WriteFailed
        })
    }

    fn set_rx_callback(&self, callback: FrameCallback) -> ChannelResult<()> {
        *self
            .shared
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
        Ok(())
    }

    fn set_allowed_ids(&self, ids: &[u32]) -> ChannelResult<()> {
        *self
            .shared
            .allowed
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = ids.to_vec();
        Ok(())
    }
}

/// Waits for a reader thread to exit. Returns false if it panicked
fn join_reader(handle: JoinHandle<()>, if_name: &str) -> bool {
    let clean = handle.join().is_ok();
    if !clean {
        log::warn!("SocketCAN reader thread for {if_name} panicked");
    }
    clean
}

impl Drop for SocketCanChannel {
    #[allow(unused_must_use)]
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_panic_is_reported() {
        let _ = env_logger::try_init();
        let handle = std::thread::spawn(|| panic!("reader failed"));
        assert!(!join_reader(handle, "vcan0"));
        assert!(join_reader(std::thread::spawn(|| {}), "vcan0"));
    }

    #[test]
    fn missing_interface_is_not_connected() {
        let ch = SocketCanChannel::new("trionic_test_none0");
        assert!(!ch.is_connected());
        assert!(matches!(
            ch.send(&CanFrame::new(0x7E0, &[0x02, 0x3E, 0x02])),
            Err(ChannelError::InterfaceNotOpen)
        ));
    }
}
