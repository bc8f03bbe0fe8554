//! Types used while running a job.

use std::path::PathBuf;

use crate::job::ResultPath;
use crate::retriever::EntryInfo;

/// One item of a batch job.
#[derive(Debug, Clone, Default)]
pub struct WorkItem {
    /// 1-based, stable across retries.
    pub index: u32,
    /// Provider entry, when the playlist was enumerable.
    pub entry: Option<EntryInfo>,
}

impl WorkItem {
    pub fn new(index: u32, entry: Option<EntryInfo>) -> Self {
        Self { index, entry }
    }

    pub fn entry_id(&self) -> Option<&str> {
        self.entry.as_ref().and_then(|e| e.id.as_deref())
    }

    pub fn title(&self) -> Option<&str> {
        self.entry.as_ref().and_then(|e| e.title.as_deref())
    }
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub result: ResultPath,
    pub zip_path: Option<PathBuf>,
}

impl RunOutput {
    pub fn single(path: PathBuf) -> Self {
        Self {
            result: ResultPath::Single(path),
            zip_path: None,
        }
    }
}
