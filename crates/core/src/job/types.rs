//! Job record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::converter::OutputFormat;
use crate::pipeline::progress::overall_percent;

/// Externally visible job status.
///
/// Statuses only move forward. `Completed`, `Error` and `Canceled` are
/// terminal and mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Downloading,
    Converting,
    Completed,
    Error,
    Canceled,
}

impl JobStatus {
    fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Processing => 1,
            JobStatus::Downloading => 2,
            JobStatus::Converting => 3,
            JobStatus::Completed | JobStatus::Error | JobStatus::Canceled => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }

    /// Returns true while a runner is working on the job.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            JobStatus::Processing | JobStatus::Downloading | JobStatus::Converting
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Downloading => "downloading",
            JobStatus::Converting => "converting",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finer-grained step the runner is in, for display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    #[default]
    Queued,
    Probing,
    Downloading,
    Converting,
    Finalizing,
    Done,
}

/// Where the media comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSource {
    /// Remote URL handled by the retriever.
    Url { url: String },
    /// File already on disk; the download stage is skipped.
    Local { path: PathBuf },
}

/// Per-entry metadata frozen by the client at submission time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// 1-based playlist index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    /// Provider id of the entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
}

/// What the caller asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub source: JobSource,
    pub format: OutputFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate_kbps: Option<u32>,
    /// Treat the source as a playlist.
    #[serde(default)]
    pub playlist: bool,
    /// 1-based playlist items to process; all items when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<EntryMetadata>,
}

impl JobRequest {
    pub fn url(url: impl Into<String>, format: OutputFormat) -> Self {
        Self {
            source: JobSource::Url { url: url.into() },
            format,
            bitrate_kbps: None,
            playlist: false,
            selection: None,
            entries: Vec::new(),
        }
    }

    pub fn local(path: impl Into<PathBuf>, format: OutputFormat) -> Self {
        Self {
            source: JobSource::Local { path: path.into() },
            ..Self::url(String::new(), format)
        }
    }

    pub fn with_playlist(mut self, playlist: bool) -> Self {
        self.playlist = playlist;
        self
    }

    pub fn with_selection(mut self, selection: Vec<u32>) -> Self {
        self.selection = Some(selection);
        self
    }

    pub fn with_entries(mut self, entries: Vec<EntryMetadata>) -> Self {
        self.entries = entries;
        self
    }

    pub fn with_bitrate(mut self, kbps: u32) -> Self {
        self.bitrate_kbps = Some(kbps);
        self
    }

    /// Batch jobs fan out into items.
    pub fn is_batch(&self) -> bool {
        self.playlist && matches!(self.source, JobSource::Url { .. })
    }
}

/// Download/convert counters of a batch job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub dl_total: u32,
    pub dl_done: u32,
    pub cv_total: u32,
    pub cv_done: u32,
}

impl JobCounters {
    pub fn with_total(total: u32) -> Self {
        Self {
            dl_total: total,
            dl_done: 0,
            cv_total: total,
            cv_done: 0,
        }
    }

    pub fn download_finished(&mut self) {
        self.dl_total = self.dl_total.max(self.dl_done + 1);
        self.dl_done += 1;
    }

    pub fn conversion_finished(&mut self) {
        self.cv_total = self.cv_total.max(self.cv_done + 1);
        self.cv_done += 1;
    }

    /// An item that will never be converted leaves the convert total.
    pub fn conversion_dropped(&mut self) {
        self.cv_total = self.cv_total.saturating_sub(1).max(self.cv_done);
    }
}

/// Item progress of a batch job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistProgress {
    pub total: u32,
    pub done: u32,
    /// Title of the item most recently started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
}

impl PlaylistProgress {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            done: 0,
            current: None,
        }
    }

    pub fn item_finished(&mut self) {
        self.total = self.total.max(self.done + 1);
        self.done += 1;
    }
}

/// Final output location(s).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultPath {
    Single(PathBuf),
    Many(Vec<PathBuf>),
}

impl ResultPath {
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            ResultPath::Single(path) => vec![path.as_path()],
            ResultPath::Many(paths) => paths.iter().map(PathBuf::as_path).collect(),
        }
    }
}

/// Descriptive metadata gathered while running.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_count: Option<u32>,
    /// Provider or enrichment specific values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One job as seen by observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub request: JobRequest,
    pub status: JobStatus,
    pub canceled: bool,
    pub progress: u8,
    pub download_progress: u8,
    pub convert_progress: u8,
    pub current_phase: JobPhase,
    pub counters: JobCounters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist: Option<PlaylistProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<ResultPath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_path: Option<PathBuf>,
    pub skipped_count: u32,
    pub errors_count: u32,
    pub error: Option<String>,
    pub metadata: JobMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: impl Into<String>, request: JobRequest) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            request,
            status: JobStatus::Queued,
            canceled: false,
            progress: 0,
            download_progress: 0,
            convert_progress: 0,
            current_phase: JobPhase::Queued,
            counters: JobCounters::default(),
            playlist: None,
            result_path: None,
            zip_path: None,
            skipped_count: 0,
            errors_count: 0,
            error: None,
            metadata: JobMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the status forward. Returns false (and changes nothing) for a
    /// backward move, a move out of a terminal state, or an error raised
    /// before the job started running.
    pub fn advance_status(&mut self, next: JobStatus) -> bool {
        if self.status.is_terminal() || next.rank() < self.status.rank() {
            return false;
        }
        if next == JobStatus::Error && !self.status.is_running() {
            return false;
        }
        self.status = next;
        true
    }

    /// Raises the download percentage; lower values are ignored.
    pub fn set_download_progress(&mut self, percent: u8) {
        self.download_progress = self.download_progress.max(percent.min(100));
        self.refresh_progress();
    }

    /// Raises the convert percentage; lower values are ignored.
    pub fn set_convert_progress(&mut self, percent: u8) {
        self.convert_progress = self.convert_progress.max(percent.min(100));
        self.refresh_progress();
    }

    fn refresh_progress(&mut self) {
        let overall = overall_percent(self.download_progress, self.convert_progress);
        self.progress = self.progress.max(overall);
    }

    /// Every file the job produced.
    pub fn output_paths(&self) -> Vec<&Path> {
        let mut paths = self
            .result_path
            .as_ref()
            .map(ResultPath::paths)
            .unwrap_or_default();
        if let Some(zip) = &self.zip_path {
            paths.push(zip.as_path());
        }
        paths
    }
}

/// Change notification broadcast by the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobUpdate {
    /// A job was created or changed; carries the full record.
    Changed { job: Box<Job> },
    /// A job was removed from the registry.
    Removed { job_id: String },
}

impl JobUpdate {
    pub fn job_id(&self) -> &str {
        match self {
            JobUpdate::Changed { job } => &job.id,
            JobUpdate::Removed { job_id } => job_id,
        }
    }
}
