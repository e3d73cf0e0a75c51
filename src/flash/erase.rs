//! Flash erase with progress polling

use std::time::{Duration, Instant};

use super::{InlineKeepAlive, WorkflowErrorKind};
use crate::{
    kwp2000::{classify_reply, negative_response, routine_request, Reply, RoutineId},
    session::SessionManager,
    DiagError,
};

/// Bounds on how long an erase may take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErasePolicy {
    /// Overall deadline, regardless of progress replies
    pub timeout: Duration,
    /// Longest silence tolerated between two replies
    pub inactivity: Duration,
}

impl Default for ErasePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            inactivity: Duration::from_secs(15),
        }
    }
}

/// Starts an erase routine and waits for it to finish.
///
/// 'Response pending' replies count as progress. 'Busy' replies re-send the request.
/// Any other negative response is a refusal.
pub fn erase(
    session: &mut SessionManager,
    routine: RoutineId,
    args: &[u8],
    policy: &ErasePolicy,
) -> Result<(), WorkflowErrorKind> {
    let _stall = session.stall();
    let request = routine_request(routine, args);
    let sid = request[0];
    let busy_delay = session.client().policy().busy_delay;
    let mut keep_alive = InlineKeepAlive::new(session);

    log::info!("Starting erase {routine:?} {args:02X?}");
    session.client().send_only(&request)?;
    let start = Instant::now();
    let mut last_activity = start;
    loop {
        let now = Instant::now();
        let until_deadline = policy.timeout.saturating_sub(now - start);
        let until_inactive = policy.inactivity.saturating_sub(now - last_activity);
        if until_deadline.is_zero() || until_inactive.is_zero() {
            log::error!("Erase timed out after {:?}", now - start);
            return Err(WorkflowErrorKind::EraseTimeout);
        }
        keep_alive.tick(session)?;
        let wait = until_deadline
            .min(until_inactive)
            .min(session.options().keep_alive_period);
        let resp = match session.client().receive_raw(wait) {
            Ok(r) => r,
            Err(DiagError::Timeout) => continue,
            Err(e) if e.is_recoverable() => {
                log::warn!("Ignoring {e} while erasing");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        match classify_reply(sid, resp) {
            Reply::Positive(r) => {
                if r.get(1) == Some(&u8::from(routine)) {
                    log::info!("Erase complete after {:?}", start.elapsed());
                    return Ok(());
                }
                log::debug!("Ignoring {r:02X?} while erasing");
            }
            Reply::Pending => {
                log::debug!("Erase in progress");
                last_activity = Instant::now();
            }
            Reply::Busy => {
                log::warn!("ECU busy, repeating erase request");
                last_activity = Instant::now();
                std::thread::sleep(busy_delay);
                session.client().send_only(&request)?;
            }
            Reply::Negative(code) => {
                let e = negative_response(sid, code);
                log::error!("Erase refused: {e}");
                return Err(WorkflowErrorKind::EraseRefused(e));
            }
            Reply::Unrelated(r) => log::debug!("Ignoring {r:02X?} while erasing"),
        }
    }
}
