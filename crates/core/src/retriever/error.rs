//! Error types for the retriever module.

use thiserror::Error;

use crate::process::{ProcessError, SkipReason};

/// Errors that can occur while retrieving media.
#[derive(Debug, Error)]
pub enum RetrieverError {
    /// The download tool invocation failed.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Metadata probing failed.
    #[error("Failed to probe source: {reason}")]
    ProbeFailed { reason: String },

    /// Tool output could not be parsed.
    #[error("Failed to parse retriever output: {reason}")]
    ParseError { reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RetrieverError {
    pub fn probe_failed(reason: impl Into<String>) -> Self {
        Self::ProbeFailed {
            reason: reason.into(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Process(e) if e.is_canceled())
    }

    /// Skipped and failed item counts reported by a failed invocation.
    pub fn item_tallies(&self) -> (u32, u32) {
        match self {
            Self::Process(e) => e.item_tallies(),
            _ => (0, 0),
        }
    }

    /// Skip classification of a failed download, if any.
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Self::Process(e) => e.skip_reason(),
            _ => None,
        }
    }
}
