//! Configuration for batch pipelines.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Concurrency and filesystem layout for job pipelines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Items downloaded at once within one batch job.
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,

    /// Items converted at once within one batch job.
    #[serde(default = "default_convert_concurrency")]
    pub convert_concurrency: usize,

    /// Metadata lookups at once within one batch job.
    #[serde(default = "default_enrich_concurrency")]
    pub enrich_concurrency: usize,

    /// Where finished outputs are written. Shared by all jobs.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Root for per-job download directories (`<temp_dir>/<job_id>`).
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Write `<job_id>.zip` next to batch outputs.
    #[serde(default)]
    pub archive_batches: bool,

    /// Time between SIGTERM and SIGKILL when stopping a tool.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

fn default_download_concurrency() -> usize {
    2
}

fn default_convert_concurrency() -> usize {
    2
}

fn default_enrich_concurrency() -> usize {
    4
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("fetchcast")
}

fn default_kill_grace_ms() -> u64 {
    3000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            download_concurrency: default_download_concurrency(),
            convert_concurrency: default_convert_concurrency(),
            enrich_concurrency: default_enrich_concurrency(),
            output_dir: default_output_dir(),
            temp_dir: default_temp_dir(),
            archive_batches: false,
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

impl PipelineConfig {
    /// Sets output and temp directories.
    pub fn with_dirs(mut self, output_dir: PathBuf, temp_dir: PathBuf) -> Self {
        self.output_dir = output_dir;
        self.temp_dir = temp_dir;
        self
    }

    /// Sets download and convert concurrency.
    pub fn with_concurrency(mut self, download: usize, convert: usize) -> Self {
        self.download_concurrency = download;
        self.convert_concurrency = convert;
        self
    }

    pub fn with_archive(mut self, archive: bool) -> Self {
        self.archive_batches = archive;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Per-job download directory.
    pub fn job_temp_dir(&self, job_id: &str) -> PathBuf {
        self.temp_dir.join(job_id)
    }
}
