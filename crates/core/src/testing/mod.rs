//! Testing utilities and mock implementations.
//!
//! The mocks stand in for the external tools so the runner, the pipeline
//! and the dispatch queue can be exercised without yt-dlp or ffmpeg
//! installed. They behave like the real tools where the orchestration can
//! tell: they register a process handle while "running", honor
//! cancellation, emit progress events and write real files.
//!
//! # Example
//!
//! ```rust,ignore
//! use fetchcast_core::testing::{fixtures, MockConverter, MockRetriever};
//!
//! let retriever = MockRetriever::new();
//! retriever.set_probe_result(fixtures::playlist(5)).await;
//! retriever.set_item(3, MockItem::Skip(SkipReason::Private)).await;
//!
//! let converter = MockConverter::new();
//! // Build an AppContext with both and submit a playlist job...
//! ```

mod mock_converter;
mod mock_enricher;
mod mock_retriever;

pub use mock_converter::MockConverter;
pub use mock_enricher::MockEnricher;
pub use mock_retriever::{MockItem, MockRetriever};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::process::{ProcessContext, ProcessError, ProcessHandle};

/// Tracks how many operations run at once.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn enter(&self) -> ProbeGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ProbeGuard { probe: self }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous operations seen.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct ProbeGuard<'a> {
    probe: &'a ConcurrencyProbe,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.probe.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Pretends to run a process for `duration`: registers a handle with the
/// context's observer and stops early on cancellation or a terminate
/// request.
pub(crate) async fn simulate_process(
    ctx: &ProcessContext,
    label: &str,
    duration: Duration,
) -> Result<(), ProcessError> {
    if ctx.cancel.is_cancelled() {
        return Err(ProcessError::Canceled);
    }

    let handle = ProcessHandle::new(label, None);
    if let Some(observer) = &ctx.observer {
        observer.on_spawn(&handle);
    }

    let result = tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = ctx.cancel.cancelled() => Err(ProcessError::Canceled),
        _ = handle.terminate_requested() => Err(ProcessError::Canceled),
    };

    if let Some(observer) = &ctx.observer {
        observer.on_exit(&handle);
    }
    result
}

/// Test fixtures and helper functions.
pub mod fixtures {
    use crate::retriever::{EntryInfo, SourceInfo};

    /// A playlist of `count` entries, each with its own URL.
    pub fn playlist(count: u32) -> SourceInfo {
        SourceInfo {
            title: Some("Test Playlist".to_string()),
            uploader: Some("Test Channel".to_string()),
            is_playlist: true,
            entries: (1..=count).map(entry).collect(),
            entry_count: Some(count),
        }
    }

    /// A playlist the provider reports a count for but does not list.
    pub fn opaque_playlist(count: u32) -> SourceInfo {
        SourceInfo {
            entries: Vec::new(),
            ..playlist(count)
        }
    }

    /// Entry `index` of a test playlist.
    pub fn entry(index: u32) -> EntryInfo {
        EntryInfo {
            index,
            id: Some(format!("vid{:03}", index)),
            url: Some(format!("https://media.example/watch?v=vid{:03}", index)),
            title: Some(format!("Track {}", index)),
            uploader: Some("Test Channel".to_string()),
            duration_secs: Some(180.0 + index as f64),
        }
    }
}
