//! Job orchestration over external media tools.
//!
//! A job fetches one URL or playlist with a download tool and converts the
//! results with a transcoder. Jobs run one at a time through the
//! [`DispatchQueue`]; inside a playlist job, items flow through a bounded
//! download stage and a bounded convert stage.

pub mod config;
pub mod context;
pub mod converter;
pub mod dispatch;
pub mod job;
pub mod metrics;
pub mod pipeline;
pub mod process;
pub mod retriever;
pub mod runner;
pub mod testing;

pub use config::{load_config, load_config_from_str, validate_config, Config, ConfigError};
pub use context::{AppContext, CancelOutcome, QueueStatus};
pub use converter::{Converter, FfmpegConverter, OutputFormat};
pub use dispatch::DispatchQueue;
pub use job::{
    Job, JobError, JobHandle, JobRegistry, JobRequest, JobSource, JobStatus, JobUpdate, ResultPath,
};
pub use retriever::{Retriever, YtDlpRetriever};
pub use runner::{JobRunner, MetadataEnricher, RunnerError};
