//! Job runner.
//!
//! [`JobRunner::run`] takes one job from queued to completed, error or
//! canceled:
//! - **Single item**: one retrieval (skipped for local files), then one
//!   conversion
//! - **Batch**: probe the playlist, then download and convert items through
//!   a [`DownloadConvertQueue`](crate::pipeline::DownloadConvertQueue)
//!
//! Existing outputs are reused instead of converting again, so re-running a
//! job with the same id resumes it.

mod archive;
mod batch;
mod error;
mod metadata;
#[allow(clippy::module_inception)]
mod runner;
mod types;

pub use error::RunnerError;
pub use metadata::{
    client_entry_for, provider_entry_for, EnrichmentQuery, ItemMetadata,
    MetadataEnricher, MetadataResolver,
};
pub use runner::JobRunner;
pub use types::{RunOutput, WorkItem};
