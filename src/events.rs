//! Notifications emitted by a test session.
//!
//! The core never draws anything itself. Whatever sits on the other side of
//! [`Notifier`] (a terminal, an execution log, an editor bridge) decides how
//! to show a run starting, going red, or new error locations.

use serde::Serialize;

use crate::traceback::{ErrorMap, TracebackMode};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// A test process is about to be spawned.
    RunStarted {
        mode: TracebackMode,
        cmd: Vec<String>,
    },
    /// The process exited and its summary line is known.
    RunFinished { summary: String, failures: bool },
    /// The current run is going to end red. Sent at most once per run.
    WillFail,
    /// A test marked as expected-to-fail passed.
    Xpassed,
    /// New error locations. `intermediate` results may still be revised.
    ErrorsUpdated { errors: ErrorMap, intermediate: bool },
    /// The test process could not be started at all.
    RunFailedToStart { reason: String },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::RunFinished { .. } => "run_finished",
            Self::WillFail => "will_fail",
            Self::Xpassed => "xpassed",
            Self::ErrorsUpdated { .. } => "errors_updated",
            Self::RunFailedToStart { .. } => "run_failed_to_start",
        }
    }
}

/// Receiver of session notifications.
pub trait Notifier {
    fn notify(&mut self, notification: &Notification) -> anyhow::Result<()>;
}

/// Collects notifications in memory.
impl Notifier for Vec<Notification> {
    fn notify(&mut self, notification: &Notification) -> anyhow::Result<()> {
        self.push(notification.clone());
        Ok(())
    }
}
