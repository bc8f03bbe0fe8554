//! Error types for the job registry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    /// A job with this id exists and has not finished.
    #[error("Job {0} is still active")]
    AlreadyActive(String),
}
