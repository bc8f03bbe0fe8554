//! Two-stage download/convert queue.
//!
//! Each item is downloaded under the download [`Limiter`] and, as soon as
//! its own download finishes, handed to the convert [`Limiter`]. Items never
//! wait for their siblings.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::limiter::Limiter;
use super::types::{DownloadOutcome, ItemOutcome, ItemResult, PoolStatus};

/// The work performed for each item.
#[async_trait]
pub trait ItemStages: Send + Sync + 'static {
    type Item: Send + Sync + 'static;

    /// Fetches the item's input, or finishes the item early.
    async fn download(&self, index: u32, item: &Self::Item) -> DownloadOutcome;

    /// Called once per item when its download stage finishes, whatever the
    /// outcome, before any conversion is submitted.
    async fn item_downloaded(&self, _index: u32, _item: &Self::Item, _outcome: &DownloadOutcome) {}

    /// Converts a downloaded input into the final output.
    async fn convert(&self, index: u32, item: Self::Item, input: PathBuf) -> ItemOutcome;
}

/// Download-then-convert pipeline for one batch job.
pub struct DownloadConvertQueue<S: ItemStages> {
    inner: Arc<QueueInner<S>>,
}

struct QueueInner<S: ItemStages> {
    stages: S,
    downloads: Limiter,
    converts: Limiter,
    cancel: CancellationToken,
    state: Mutex<QueueState>,
    idle: Notify,
}

#[derive(Default)]
struct QueueState {
    pending: usize,
    ended: bool,
    seen: HashSet<u32>,
    results: BTreeMap<u32, ItemOutcome>,
}

/// An item that has not reached its final outcome yet. Dropping it without
/// finishing (task panicked, runtime gone) records a failure so the queue
/// still drains.
struct PendingItem<S: ItemStages> {
    inner: Arc<QueueInner<S>>,
    index: u32,
    finished: bool,
}

impl<S: ItemStages> PendingItem<S> {
    fn finish(mut self, outcome: ItemOutcome) {
        self.finished = true;
        self.inner.record(self.index, outcome);
    }
}

impl<S: ItemStages> Drop for PendingItem<S> {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.record(
                self.index,
                ItemOutcome::Failed {
                    error: "item task aborted".to_string(),
                },
            );
        }
    }
}

impl<S: ItemStages> QueueInner<S> {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers an index; `None` when it was already submitted.
    fn begin(self: &Arc<Self>, index: u32) -> Option<PendingItem<S>> {
        let mut state = self.lock();
        if !state.seen.insert(index) {
            return None;
        }
        state.pending += 1;
        Some(PendingItem {
            inner: Arc::clone(self),
            index,
            finished: false,
        })
    }

    fn record(&self, index: u32, outcome: ItemOutcome) {
        debug!(index, outcome = outcome.as_str(), "Item finished");
        let idle = {
            let mut state = self.lock();
            state.results.insert(index, outcome);
            state.pending = state.pending.saturating_sub(1);
            state.pending == 0 && state.ended
        };
        if idle {
            self.idle.notify_waiters();
        }
    }

    fn is_idle(&self) -> bool {
        let state = self.lock();
        state.pending == 0 && state.ended
    }

    fn submit_download(self: &Arc<Self>, pending: PendingItem<S>, item: S::Item) {
        let inner = Arc::clone(self);
        // The ticket is not needed; outcomes are recorded through `pending`.
        let _ = self.downloads.run(async move {
            if inner.cancel.is_cancelled() {
                pending.finish(ItemOutcome::Canceled);
                return;
            }
            let outcome = inner.stages.download(pending.index, &item).await;
            inner
                .stages
                .item_downloaded(pending.index, &item, &outcome)
                .await;
            match outcome {
                DownloadOutcome::Downloaded(path) => inner.submit_convert(pending, item, path),
                DownloadOutcome::Finished(outcome) => pending.finish(outcome),
            }
        });
    }

    fn submit_convert(self: &Arc<Self>, pending: PendingItem<S>, item: S::Item, input: PathBuf) {
        let inner = Arc::clone(self);
        let _ = self.converts.run(async move {
            if inner.cancel.is_cancelled() {
                pending.finish(ItemOutcome::Canceled);
                return;
            }
            let outcome = inner.stages.convert(pending.index, item, input).await;
            pending.finish(outcome);
        });
    }
}

impl<S: ItemStages> DownloadConvertQueue<S> {
    pub fn new(
        stages: S,
        download_concurrency: usize,
        convert_concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                stages,
                downloads: Limiter::new("download", download_concurrency),
                converts: Limiter::new("convert", convert_concurrency),
                cancel,
                state: Mutex::new(QueueState::default()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn stages(&self) -> &S {
        &self.inner.stages
    }

    /// Submits an item to the download stage. Indices must be unique;
    /// a repeated index is ignored.
    pub fn enqueue(&self, index: u32, item: S::Item) {
        match self.inner.begin(index) {
            Some(pending) => self.inner.submit_download(pending, item),
            None => warn!(index, "Item already enqueued, ignoring"),
        }
    }

    /// Submits an item whose input was already downloaded elsewhere.
    pub fn enqueue_downloaded(&self, index: u32, item: S::Item, input: PathBuf) {
        match self.inner.begin(index) {
            Some(pending) => self.inner.submit_convert(pending, item, input),
            None => warn!(index, "Item already enqueued, ignoring"),
        }
    }

    /// Marks that no more items will be enqueued.
    pub fn end(&self) {
        let idle = {
            let mut state = self.inner.lock();
            state.ended = true;
            state.pending == 0
        };
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    /// Resolves once [`end`](Self::end) was called and every submitted item
    /// has a final outcome, or as soon as cancellation is observed.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.is_idle() || self.inner.cancel.is_cancelled() {
                return;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.inner.cancel.cancelled() => return,
            }
        }
    }

    /// Results recorded so far, ordered by item index.
    pub fn results(&self) -> Vec<ItemResult> {
        self.inner
            .lock()
            .results
            .iter()
            .map(|(index, outcome)| ItemResult {
                index: *index,
                outcome: outcome.clone(),
            })
            .collect()
    }

    /// Items submitted but not yet finished.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending
    }

    pub fn download_status(&self) -> PoolStatus {
        self.inner.downloads.status()
    }

    pub fn convert_status(&self) -> PoolStatus {
        self.inner.converts.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SkipReason;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct TestStages {
        log: Mutex<Vec<String>>,
        downloads_started: AtomicUsize,
        active_downloads: AtomicUsize,
        peak_downloads: AtomicUsize,
        active_converts: AtomicUsize,
        peak_converts: AtomicUsize,
    }

    impl TestStages {
        fn push(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }

        fn position(&self, entry: &str) -> usize {
            self.log
                .lock()
                .unwrap()
                .iter()
                .position(|e| e == entry)
                .unwrap_or_else(|| panic!("{entry} not logged"))
        }
    }

    /// Item payload is the simulated download delay in milliseconds.
    #[async_trait]
    impl ItemStages for TestStages {
        type Item = u64;

        async fn download(&self, index: u32, delay_ms: &u64) -> DownloadOutcome {
            self.downloads_started.fetch_add(1, Ordering::SeqCst);
            let now = self.active_downloads.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_downloads.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
            self.active_downloads.fetch_sub(1, Ordering::SeqCst);

            match index {
                3 => DownloadOutcome::Finished(ItemOutcome::Skipped {
                    reason: SkipReason::Private,
                }),
                4 => DownloadOutcome::Finished(ItemOutcome::Failed {
                    error: "HTTP 403".to_string(),
                }),
                _ => DownloadOutcome::Downloaded(PathBuf::from(format!("/tmp/in_{index}"))),
            }
        }

        async fn item_downloaded(&self, index: u32, _item: &u64, _outcome: &DownloadOutcome) {
            self.push(format!("dl-done-{index}"));
        }

        async fn convert(&self, index: u32, _item: u64, input: PathBuf) -> ItemOutcome {
            self.push(format!("cv-start-{index}"));
            let now = self.active_converts.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_converts.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.active_converts.fetch_sub(1, Ordering::SeqCst);
            ItemOutcome::Converted {
                path: input.with_extension("mp3"),
            }
        }
    }

    #[tokio::test]
    async fn test_results_sorted_by_index() {
        let queue = DownloadConvertQueue::new(TestStages::default(), 2, 2, CancellationToken::new());
        for (index, delay) in [(5, 1), (1, 30), (2, 5), (3, 1), (4, 10)] {
            queue.enqueue(index, delay);
        }
        queue.end();
        queue.wait_for_idle().await;

        let results = queue.results();
        let indices: Vec<u32> = results.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
        assert_eq!(
            results[2].outcome,
            ItemOutcome::Skipped {
                reason: SkipReason::Private
            }
        );
        assert!(matches!(results[3].outcome, ItemOutcome::Failed { .. }));
        assert_eq!(
            results[0].outcome.output(),
            Some(PathBuf::from("/tmp/in_1.mp3").as_path())
        );
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_convert_starts_before_slow_sibling_downloads() {
        let queue = DownloadConvertQueue::new(TestStages::default(), 2, 2, CancellationToken::new());
        queue.enqueue(1, 5);
        queue.enqueue(2, 150);
        queue.end();
        queue.wait_for_idle().await;

        let stages = queue.stages();
        assert!(stages.position("cv-start-1") < stages.position("dl-done-2"));
    }

    #[tokio::test]
    async fn test_concurrency_bounds_hold_per_stage() {
        let queue = DownloadConvertQueue::new(TestStages::default(), 2, 1, CancellationToken::new());
        for index in [1, 2, 5, 6, 7, 8] {
            queue.enqueue(index, 10);
        }
        queue.end();
        queue.wait_for_idle().await;

        let stages = queue.stages();
        assert!(stages.peak_downloads.load(Ordering::SeqCst) <= 2);
        assert_eq!(stages.peak_converts.load(Ordering::SeqCst), 1);
        assert_eq!(queue.results().len(), 6);
    }

    #[tokio::test]
    async fn test_enqueue_downloaded_skips_download_stage() {
        let queue = DownloadConvertQueue::new(TestStages::default(), 1, 1, CancellationToken::new());
        queue.enqueue_downloaded(7, 0, PathBuf::from("/tmp/pre_7.webm"));
        queue.end();
        queue.wait_for_idle().await;

        assert_eq!(queue.stages().downloads_started.load(Ordering::SeqCst), 0);
        assert_eq!(
            queue.results(),
            vec![ItemResult {
                index: 7,
                outcome: ItemOutcome::Converted {
                    path: PathBuf::from("/tmp/pre_7.mp3")
                }
            }]
        );
    }

    #[tokio::test]
    async fn test_wait_for_idle_with_no_items() {
        let queue = DownloadConvertQueue::new(TestStages::default(), 2, 2, CancellationToken::new());
        queue.end();
        tokio::time::timeout(Duration::from_secs(1), queue.wait_for_idle())
            .await
            .unwrap();
        assert!(queue.results().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_index_ignored() {
        let queue = DownloadConvertQueue::new(TestStages::default(), 2, 2, CancellationToken::new());
        queue.enqueue(1, 1);
        queue.enqueue(1, 1);
        queue.end();
        queue.wait_for_idle().await;
        assert_eq!(queue.stages().downloads_started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_discards_pending_items() {
        let cancel = CancellationToken::new();
        let queue = DownloadConvertQueue::new(TestStages::default(), 1, 1, cancel.clone());
        for index in 1..=4 {
            queue.enqueue(index, 50);
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(20), queue.wait_for_idle())
            .await
            .unwrap();

        queue.end();
        // Let the in-flight download finish and the rest drain as canceled.
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(queue.stages().downloads_started.load(Ordering::SeqCst), 1);
        let results = queue.results();
        assert_eq!(results.len(), 4);
        assert!(results[1..]
            .iter()
            .all(|r| r.outcome == ItemOutcome::Canceled));
    }
}
