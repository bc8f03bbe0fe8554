//! Dispatch queue.
//!
//! Jobs start strictly in submission order and only one job's runner is
//! active at a time. Concurrency happens inside a runner, never between
//! runners.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::metrics;

type StartJob = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// A job waiting to start.
pub struct QueueEntry {
    pub job_id: String,
    start: StartJob,
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry")
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

struct DispatchInner {
    entries: Mutex<VecDeque<QueueEntry>>,
    running: AtomicBool,
    is_canceled: Box<dyn Fn(&str) -> bool + Send + Sync>,
    idle: Notify,
}

impl DispatchInner {
    fn lock(&self) -> MutexGuard<'_, VecDeque<QueueEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pops the next entry, or clears the running flag when empty. The flag
    /// is cleared under the entries lock so an enqueue either lands before
    /// the pop or sees the flag cleared.
    fn next(&self) -> Option<QueueEntry> {
        let mut entries = self.lock();
        let entry = entries.pop_front();
        metrics::DISPATCH_QUEUE_DEPTH.set(entries.len() as i64);
        if entry.is_none() {
            self.running.store(false, Ordering::SeqCst);
        }
        entry
    }
}

/// FIFO of pending job starts.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<DispatchInner>,
}

impl DispatchQueue {
    /// `is_canceled` is consulted right before an entry starts; canceled
    /// jobs are skipped.
    pub fn new<F>(is_canceled: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(DispatchInner {
                entries: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
                is_canceled: Box::new(is_canceled),
                idle: Notify::new(),
            }),
        }
    }

    /// Appends a job start and begins draining if the queue is idle.
    pub fn enqueue<F, Fut>(&self, job_id: impl Into<String>, start: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let job_id = job_id.into();
        debug!(job_id = %job_id, "Queued job");
        {
            let mut entries = self.inner.lock();
            entries.push_back(QueueEntry {
                job_id,
                start: Box::new(move || start().boxed()),
            });
            metrics::DISPATCH_QUEUE_DEPTH.set(entries.len() as i64);
        }
        self.ensure_draining();
    }

    /// Drops every not-yet-started entry for `job_id`.
    pub fn remove_from_queue(&self, job_id: &str) -> usize {
        let mut entries = self.inner.lock();
        let before = entries.len();
        entries.retain(|entry| entry.job_id != job_id);
        metrics::DISPATCH_QUEUE_DEPTH.set(entries.len() as i64);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// True while the drain loop is active.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Ids of jobs waiting to start, in start order.
    pub fn pending_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .iter()
            .map(|entry| entry.job_id.clone())
            .collect()
    }

    /// Resolves once the queue is empty and no runner is active.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_running() && self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn ensure_draining(&self) {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(drain(Arc::clone(&self.inner)));
            }
            Err(_) => {
                warn!("No runtime available, dispatch queue not draining");
                self.inner.running.store(false, Ordering::SeqCst);
            }
        }
    }
}

async fn drain(inner: Arc<DispatchInner>) {
    while let Some(entry) = inner.next() {
        let QueueEntry { job_id, start } = entry;
        if (inner.is_canceled)(&job_id) {
            info!(job_id = %job_id, "Skipping canceled job");
            continue;
        }

        debug!(job_id = %job_id, "Dispatching job");
        let outcome = AssertUnwindSafe(async move { start().await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => debug!(job_id = %job_id, "Job runner finished"),
            Ok(Err(e)) => error!(job_id = %job_id, error = %format!("{:#}", e), "Job failed"),
            Err(panic) => error!(
                job_id = %job_id,
                panic = %panic_message(&*panic),
                "Job runner panicked"
            ),
        }
    }
    inner.idle.notify_waiters();
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
