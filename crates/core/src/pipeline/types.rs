//! Types shared by the pipeline primitives.

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::process::SkipReason;

/// Snapshot of one limiter.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// Pool name (e.g., "download", "convert").
    pub name: String,
    /// Number of active tasks.
    pub active_jobs: usize,
    /// Maximum concurrent tasks.
    pub max_concurrent: usize,
    /// Number of queued tasks.
    pub queued_jobs: usize,
    /// Total tasks finished since creation.
    pub total_processed: u64,
    /// Tasks that panicked or were dropped before finishing.
    pub total_failed: u64,
}

/// Final outcome of one batch item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Converted { path: PathBuf },
    /// An earlier run already produced this output.
    Reused { path: PathBuf },
    Skipped { reason: SkipReason },
    Failed { error: String },
    Canceled,
}

impl ItemOutcome {
    pub fn output(&self) -> Option<&Path> {
        match self {
            ItemOutcome::Converted { path } | ItemOutcome::Reused { path } => Some(path),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Converted { .. } => "converted",
            ItemOutcome::Reused { .. } => "reused",
            ItemOutcome::Skipped { .. } => "skipped",
            ItemOutcome::Failed { .. } => "failed",
            ItemOutcome::Canceled => "canceled",
        }
    }
}

/// Result record for one item, keyed by its stable 1-based index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemResult {
    pub index: u32,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

/// What the download stage produced for an item.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    /// Input ready for the convert stage.
    Downloaded(PathBuf),
    /// The item is finished without converting (reused, skipped, failed).
    Finished(ItemOutcome),
}
