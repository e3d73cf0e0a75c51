//! Tester present keep-alive and the stall flag it shares with long running transfers

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    channel::{CanFrame, FrameChannel},
    segmented::PAD_BYTE,
};

/// Single frame carrying a tester present which the ECU does not answer
pub const TESTER_PRESENT_FRAME: [u8; 8] = [
    0x02, 0x3E, 0x02, PAD_BYTE, PAD_BYTE, PAD_BYTE, PAD_BYTE, PAD_BYTE,
];

const IDLE: u8 = 0;
const SENDING: u8 = 1;
const STALLED: u8 = 2;

const TICK: Duration = Duration::from_millis(10);

/// Arbitrates the channel between the periodic keep-alive and a stalled workflow.
///
/// The keep-alive only ever tries to move `IDLE -> SENDING` and skips its turn if that fails.
/// A workflow moves `IDLE -> STALLED` and then owns the keep-alive duty until its
/// [StallGuard] is dropped.
#[derive(Debug, Default)]
pub struct StallFlag(AtomicU8);

impl StallFlag {
    /// Creates an idle flag
    pub fn new() -> Self {
        Self(AtomicU8::new(IDLE))
    }

    /// True while a workflow holds the stall
    pub fn is_stalled(&self) -> bool {
        self.0.load(Ordering::Acquire) == STALLED
    }

    /// Claims the channel for one keep-alive frame. Never blocks
    pub fn try_begin_send(self: &Arc<Self>) -> Option<SendPermit> {
        self.0
            .compare_exchange(IDLE, SENDING, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SendPermit(Arc::clone(self)))
    }

    /// Stalls the periodic keep-alive until the returned guard is dropped.
    ///
    /// Waits only for a keep-alive frame already being written. Stalling an already
    /// stalled flag returns a guard which releases nothing.
    pub fn stall(self: &Arc<Self>) -> StallGuard {
        loop {
            match self
                .0
                .compare_exchange(IDLE, STALLED, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    log::debug!("Keep-alive stalled");
                    return StallGuard {
                        flag: Arc::clone(self),
                        release: true,
                    };
                }
                Err(STALLED) => {
                    return StallGuard {
                        flag: Arc::clone(self),
                        release: false,
                    };
                }
                Err(_) => std::thread::yield_now(),
            }
        }
    }
}

/// Permission to send exactly one keep-alive frame
#[derive(Debug)]
pub struct SendPermit(Arc<StallFlag>);

impl Drop for SendPermit {
    fn drop(&mut self) {
        self.0 .0.store(IDLE, Ordering::Release);
    }
}

/// Keeps the periodic keep-alive stalled while alive
#[derive(Debug)]
pub struct StallGuard {
    flag: Arc<StallFlag>,
    release: bool,
}

impl Drop for StallGuard {
    fn drop(&mut self) {
        if self.release {
            self.flag.0.store(IDLE, Ordering::Release);
            log::debug!("Keep-alive resumed");
        }
    }
}

/// Periodic tester present task
#[derive(Debug)]
pub struct KeepAlive {
    running: Arc<AtomicBool>,
    sent: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl KeepAlive {
    /// Starts sending [TESTER_PRESENT_FRAME] on `tx_id` every `period`, unless stalled
    pub fn start(
        channel: Arc<dyn FrameChannel>,
        tx_id: u32,
        stall: Arc<StallFlag>,
        period: Duration,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let sent = Arc::new(AtomicU64::new(0));
        let skipped = Arc::new(AtomicU64::new(0));
        let running_t = running.clone();
        let sent_t = sent.clone();
        let skipped_t = skipped.clone();
        let frame = CanFrame::new(tx_id, &TESTER_PRESENT_FRAME);
        let handle = std::thread::spawn(move || {
            let mut last = Instant::now();
            while running_t.load(Ordering::Relaxed) {
                std::thread::sleep(TICK);
                if last.elapsed() < period {
                    continue;
                }
                last = Instant::now();
                match stall.try_begin_send() {
                    Some(_permit) => match channel.send(&frame) {
                        Ok(()) => {
                            sent_t.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => log::warn!("Tester present send failure: {e}"),
                    },
                    None => {
                        skipped_t.fetch_add(1, Ordering::Relaxed);
                        log::debug!("Session stalled, skipping tester present");
                    }
                }
            }
        });
        Self {
            running,
            sent,
            skipped,
            handle: Some(handle),
        }
    }

    /// Number of tester present frames sent by the task
    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Number of periods skipped because the session was stalled
    pub fn periods_skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// True until [KeepAlive::stop] is called
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stops the task and waits for it to exit
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                log::error!("Keep-alive thread panicked");
            }
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{kwp2000::TESTER_PRESENT_NO_RESPONSE, segmented::single_frame};

    #[test]
    fn frame_is_single_frame_tester_present() {
        assert_eq!(single_frame(&TESTER_PRESENT_NO_RESPONSE).unwrap(), TESTER_PRESENT_FRAME);
    }

    #[test]
    fn stall_excludes_sends() {
        let flag = Arc::new(StallFlag::new());
        {
            let _g = flag.stall();
            assert!(flag.is_stalled());
            assert!(flag.try_begin_send().is_none());
            {
                let _nested = flag.stall();
            }
            assert!(flag.is_stalled());
        }
        assert!(!flag.is_stalled());
        let permit = flag.try_begin_send();
        assert!(permit.is_some());
        assert!(flag.try_begin_send().is_none());
        drop(permit);
        assert!(flag.try_begin_send().is_some());
    }
}
