//! Bounded inbox for frames from the ECU
//!
//! Every request follows the same pattern: [Listener::setup_wait] declares the identifiers
//! of interest, the request is transmitted, then [Listener::wait_for] blocks until a matching
//! frame arrives or the timeout expires. Arming before transmitting means a fast ECU reply
//! can never arrive before anyone is listening for it.
//!
//! A timeout is a normal outcome, and is reported as `None`.

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use crate::channel::{ChannelResult, FrameChannel, CanFrame};

/// Default number of frames buffered before the oldest is discarded
pub const DEFAULT_QUEUE_DEPTH: usize = 512;

#[derive(Debug, Default)]
struct ListenerState {
    ids: Vec<u32>,
    queue: VecDeque<CanFrame>,
    dropped: u64,
}

/// Bounded FIFO of inbound frames, fed by a channel's receive callback
#[derive(Debug)]
pub struct Listener {
    state: Mutex<ListenerState>,
    signal: Condvar,
    capacity: usize,
}

impl Default for Listener {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl Listener {
    /// Creates a listener which buffers at most `capacity` frames
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ListenerState::default()),
            signal: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Registers this listener as the receive callback of a channel
    pub fn attach(self: &Arc<Self>, channel: &dyn FrameChannel) -> ChannelResult<()> {
        let listener = Arc::clone(self);
        channel.set_rx_callback(Arc::new(move |frame| {
            listener.on_frame(frame);
        }))
    }

    fn lock(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands a received frame to the listener. Returns false if the frame was not of interest
    pub fn on_frame(&self, frame: CanFrame) -> bool {
        let mut state = self.lock();
        if !state.ids.contains(&frame.id()) {
            return false;
        }
        if state.queue.len() >= self.capacity {
            state.queue.pop_front();
            state.dropped += 1;
            log::warn!("Listener queue full, discarded oldest frame ({} dropped)", state.dropped);
        }
        state.queue.push_back(frame);
        drop(state);
        self.signal.notify_all();
        true
    }

    /// Declares the identifiers of interest. Frames already queued for these identifiers are kept
    pub fn setup_wait(&self, ids: &[u32]) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.ids.clear();
        state.ids.extend_from_slice(ids);
        state.queue.retain(|f| state.ids.contains(&f.id()));
    }

    /// Waits up to `timeout` for the next frame with an identifier in `ids`
    pub fn wait_for(&self, ids: &[u32], timeout: Duration) -> Option<CanFrame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(pos) = state.queue.iter().position(|f| ids.contains(&f.id())) {
                return state.queue.remove(pos);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .signal
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Discards every buffered frame, keeping the armed identifiers
    pub fn flush(&self) {
        let mut state = self.lock();
        if !state.queue.is_empty() {
            log::debug!("Flushing {} stale frame(s)", state.queue.len());
        }
        state.queue.clear();
    }

    /// Discards every buffered frame and disarms the listener
    pub fn clear(&self) {
        let mut state = self.lock();
        state.queue.clear();
        state.ids.clear();
    }

    /// Number of frames currently buffered
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unarmed_frames_are_dropped() {
        let l = Listener::default();
        assert!(!l.on_frame(CanFrame::new(0x7E8, &[0x01, 0x7E])));
        l.setup_wait(&[0x7E8]);
        assert!(l.on_frame(CanFrame::new(0x7E8, &[0x01, 0x7E])));
        assert!(!l.on_frame(CanFrame::new(0x5E8, &[0x01, 0x7E])));
        assert_eq!(l.pending(), 1);
    }

    #[test]
    fn wait_times_out_with_none() {
        let l = Listener::default();
        l.setup_wait(&[0x7E8]);
        let start = Instant::now();
        assert!(l.wait_for(&[0x7E8], Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wait_returns_frames_in_order_across_threads() {
        let l = Arc::new(Listener::default());
        l.setup_wait(&[0x7E8]);
        let l2 = l.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            l2.on_frame(CanFrame::new(0x7E8, &[0x01]));
            l2.on_frame(CanFrame::new(0x7E8, &[0x02]));
        });
        let a = l.wait_for(&[0x7E8], Duration::from_secs(1)).unwrap();
        let b = l.wait_for(&[0x7E8], Duration::from_secs(1)).unwrap();
        t.join().unwrap();
        assert_eq!(a.data(), &[0x01]);
        assert_eq!(b.data(), &[0x02]);
    }

    #[test]
    fn bounded_queue_discards_oldest() {
        let l = Listener::new(2);
        l.setup_wait(&[1]);
        for i in 0..3u8 {
            l.on_frame(CanFrame::new(1, &[i]));
        }
        assert_eq!(l.pending(), 2);
        assert_eq!(l.wait_for(&[1], Duration::ZERO).unwrap().data(), &[1]);
    }

    #[test]
    fn flush_and_clear() {
        let l = Listener::default();
        l.setup_wait(&[1]);
        l.on_frame(CanFrame::new(1, &[0]));
        l.flush();
        assert_eq!(l.pending(), 0);
        assert!(l.on_frame(CanFrame::new(1, &[0])));
        l.clear();
        assert_eq!(l.pending(), 0);
        assert!(!l.on_frame(CanFrame::new(1, &[0])));
    }
}
