//! Error types for the process driver.

use thiserror::Error;

use super::classify::SkipReason;

/// Errors from one external tool invocation.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The binary could not be started.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error while waiting on the child.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The job was canceled or the process was terminated by a signal.
    #[error("Process canceled")]
    Canceled,

    /// The invocation exceeded its own timeout and was killed.
    #[error("{program} timed out after {timeout_secs} seconds")]
    Timeout { program: String, timeout_secs: u64 },

    /// Nonzero exit (or no output) with nothing usable produced.
    #[error(
        "{program} failed with exit code {code:?}: {}",
        .stderr_tail.last().map(String::as_str).unwrap_or("no output")
    )]
    Failed {
        program: String,
        code: Option<i32>,
        stderr_tail: Vec<String>,
        skipped: u32,
        errors: u32,
        skip_reason: Option<SkipReason>,
    },
}

impl ProcessError {
    /// Whether this error is the cancellation sentinel rather than a failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// The skip classification of a failed invocation, if its output said
    /// the content is unavailable.
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Self::Failed { skip_reason, .. } => *skip_reason,
            _ => None,
        }
    }

    /// Skipped and failed item counts of a failed invocation.
    pub fn item_tallies(&self) -> (u32, u32) {
        match self {
            Self::Failed {
                skipped, errors, ..
            } => (*skipped, *errors),
            _ => (0, 0),
        }
    }
}
