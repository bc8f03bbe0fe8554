//! Item-level pipeline primitives for batch jobs.
//!
//! - [`Limiter`]: FIFO executor that runs at most N tasks at once
//! - [`DownloadConvertQueue`]: pairs a download limiter with a convert
//!   limiter so each item converts as soon as its own download finishes
//! - [`progress`]: pure folding of per-stage counters into percentages
//! - [`reuse`]: lookup of previously produced outputs by item identity

mod config;
mod limiter;
pub mod progress;
mod queue;
pub mod reuse;
mod types;

pub use config::PipelineConfig;
pub use limiter::{Limiter, LimiterError, LimiterTicket};
pub use progress::StageProgress;
pub use queue::{DownloadConvertQueue, ItemStages};
pub use reuse::{find_reusable_output, item_identity};
pub use types::{DownloadOutcome, ItemOutcome, ItemResult, PoolStatus};
