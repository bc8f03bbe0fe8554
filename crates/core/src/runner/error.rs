//! Error types for the job runner.

use thiserror::Error;

use crate::converter::ConverterError;
use crate::retriever::RetrieverError;

/// Errors that end a job.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The job was canceled. Not a failure.
    #[error("Job canceled")]
    Canceled,

    #[error("Retrieval failed: {0}")]
    Retrieval(#[from] RetrieverError),

    #[error("Conversion failed: {0}")]
    Conversion(#[from] ConverterError),

    /// A batch finished without a single usable output.
    #[error("No items could be processed ({skipped} skipped, {errors} failed)")]
    NoOutputs { skipped: u32, errors: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RunnerError {
    pub fn is_canceled(&self) -> bool {
        match self {
            RunnerError::Canceled => true,
            RunnerError::Retrieval(e) => e.is_canceled(),
            RunnerError::Conversion(e) => e.is_canceled(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessError;

    #[test]
    fn test_cancellation_is_recognized_through_wrappers() {
        assert!(RunnerError::Canceled.is_canceled());
        assert!(RunnerError::Retrieval(RetrieverError::Process(ProcessError::Canceled)).is_canceled());
        assert!(RunnerError::Conversion(ConverterError::Process(ProcessError::Canceled)).is_canceled());
        assert!(!RunnerError::NoOutputs { skipped: 1, errors: 0 }.is_canceled());
    }

    #[test]
    fn test_no_outputs_message() {
        let err = RunnerError::NoOutputs { skipped: 2, errors: 3 };
        assert_eq!(
            err.to_string(),
            "No items could be processed (2 skipped, 3 failed)"
        );
    }
}
