//! Errors collected while shutting the process down.

use std::time::Duration;

use thiserror::Error;

/// One shutdown task that did not complete cleanly. None of these stop the sibling tasks
/// or the later phases, they only make the final [`ShutdownReport`](crate::ShutdownReport)
/// unclean.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShutdownError {
    /// The task's action returned an error.
    #[error("shutdown task '{name}' failed: {reason}")]
    TaskFailed { name: String, reason: String },

    /// The phase timeout elapsed while the task was still running; it was aborted.
    #[error("shutdown task '{name}' abandoned after {timeout:?}")]
    TaskAbandoned { name: String, timeout: Duration },

    /// The task panicked or was cancelled before reporting.
    #[error("shutdown task '{name}' panicked")]
    TaskPanicked { name: String },
}

impl ShutdownError {
    pub fn task(&self) -> &str {
        match self {
            ShutdownError::TaskFailed { name, .. }
            | ShutdownError::TaskAbandoned { name, .. }
            | ShutdownError::TaskPanicked { name } => name,
        }
    }
}
