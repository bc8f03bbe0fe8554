//! Types for the retriever module.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::process::SkipReason;

/// What a probe learned about a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub is_playlist: bool,
    /// Entries in playlist order; empty when the provider does not list them.
    pub entries: Vec<EntryInfo>,
    /// Provider-reported item count.
    pub entry_count: Option<u32>,
}

/// One entry of a playlist as reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryInfo {
    /// 1-based position in the playlist.
    pub index: u32,
    pub id: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration_secs: Option<f64>,
}

/// One retrieval invocation.
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub job_id: String,
    /// Output stem. Per-item requests use `<job_id>_<index>`; whole-playlist
    /// requests leave it `None` and files are named by playlist index.
    pub item_id: Option<String>,
    pub url: String,
    /// Treat `url` as a playlist.
    pub is_batch: bool,
    /// 1-based playlist items to fetch.
    pub selection: Option<Vec<u32>>,
    /// Fetch only the audio stream.
    pub audio_only: bool,
    /// Directory downloads are written to.
    pub temp_dir: PathBuf,
    /// Number of files expected, for progress scaling.
    pub expected_total: Option<u32>,
}

/// Files produced by a retrieval invocation.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutput {
    pub files: Vec<PathBuf>,
    pub skipped: u32,
    pub errors: u32,
    pub skip_reasons: Vec<SkipReason>,
}
