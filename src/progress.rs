//! Progress and activity reporting
//!
//! Workflows report through a [ProgressSink] and never format UI text themselves.

use strum_macros::{AsRefStr, Display};

/// Category of an activity message
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, AsRefStr)]
pub enum ActivityKind {
    /// A workflow phase started
    Phase,
    /// General information
    Info,
    /// Something went wrong but the workflow continues
    Warning,
    /// The workflow failed
    Error,
}

/// Receives workflow progress
pub trait ProgressSink {
    /// Overall progress of the current phase, 0-100
    fn on_progress(&self, percent: u8);
    /// A message about what the workflow is doing
    fn on_activity(&self, message: String, kind: ActivityKind);
}

/// Forwards progress to the `log` facade
#[derive(Debug, Default, Copy, Clone)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_progress(&self, percent: u8) {
        log::trace!("Progress {percent}%");
    }

    fn on_activity(&self, message: String, kind: ActivityKind) {
        match kind {
            ActivityKind::Phase | ActivityKind::Info => log::info!("{message}"),
            ActivityKind::Warning => log::warn!("{message}"),
            ActivityKind::Error => log::error!("{message}"),
        }
    }
}

/// Percentage of `done` out of `total`, clamped to 100
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.saturating_mul(100) / total).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentages() {
        assert_eq!(percent(0, 20), 0);
        assert_eq!(percent(10, 20), 50);
        assert_eq!(percent(25, 20), 100);
        assert_eq!(percent(0, 0), 100);
        assert_eq!(ActivityKind::Warning.as_ref(), "Warning");
    }
}
