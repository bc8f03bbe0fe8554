//! Jobs: the record observers read, and the registry that owns it.

mod error;
mod registry;
mod types;

pub use error::JobError;
pub use registry::{JobHandle, JobRegistry};
pub use types::{
    EntryMetadata, Job, JobCounters, JobMetadata, JobPhase, JobRequest, JobSource, JobStatus,
    JobUpdate, PlaylistProgress, ResultPath,
};
