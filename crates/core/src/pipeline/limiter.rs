//! Bounded concurrency limiter.
//!
//! Unlike a semaphore, submission is synchronous: [`Limiter::run`] queues
//! the task before returning, so tasks start in exactly the order they were
//! submitted even if nobody awaits the ticket right away.

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

use super::types::PoolStatus;

/// Errors delivered to a task's own ticket.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LimiterError {
    /// The task panicked or was dropped before producing a value.
    #[error("task aborted before producing a result")]
    Aborted,
}

type Task = BoxFuture<'static, ()>;

/// Runs at most `max` submitted futures at once, starting queued ones in
/// FIFO order as slots free up. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Limiter {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    max: usize,
    state: Mutex<State>,
    total_processed: AtomicU64,
    total_failed: AtomicU64,
}

#[derive(Default)]
struct State {
    active: usize,
    queue: VecDeque<Task>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Resolves to the submitted task's output.
///
/// Dropping a ticket does not cancel the task.
pub struct LimiterTicket<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for LimiterTicket<T> {
    type Output = Result<T, LimiterError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| LimiterError::Aborted))
    }
}

/// Frees a slot when a task ends, however it ends.
struct Slot {
    inner: Arc<Inner>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.inner.total_processed.fetch_add(1, Ordering::Relaxed);
        if std::thread::panicking() {
            self.inner.total_failed.fetch_add(1, Ordering::Relaxed);
        }

        let next = {
            let mut state = self.inner.lock();
            match state.queue.pop_front() {
                Some(task) => Some(task),
                None => {
                    state.active = state.active.saturating_sub(1);
                    None
                }
            }
        };

        if let Some(task) = next {
            Limiter::spawn(Arc::clone(&self.inner), task);
        }
    }
}

impl Limiter {
    /// Creates a limiter; `max` of zero is treated as one.
    pub fn new(name: impl Into<String>, max: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                max: max.max(1),
                state: Mutex::new(State::default()),
                total_processed: AtomicU64::new(0),
                total_failed: AtomicU64::new(0),
            }),
        }
    }

    /// Submits a task. It starts now if a slot is free, otherwise after
    /// every previously queued task has started.
    pub fn run<F, T>(&self, task: F) -> LimiterTicket<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task: Task = Box::pin(async move {
            // Receiver gone means the caller stopped caring about the value.
            let _ = tx.send(task.await);
        });

        let start_now = {
            let mut state = self.inner.lock();
            if state.active < self.inner.max {
                state.active += 1;
                Some(task)
            } else {
                state.queue.push_back(task);
                None
            }
        };

        if let Some(task) = start_now {
            Self::spawn(Arc::clone(&self.inner), task);
        }

        LimiterTicket { rx }
    }

    fn spawn(inner: Arc<Inner>, task: Task) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _slot = Slot { inner };
                    task.await;
                });
            }
            Err(_) => {
                warn!(pool = %inner.name, "No runtime available, dropping limiter task");
                drop(Slot { inner });
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max
    }

    pub fn active(&self) -> usize {
        self.inner.lock().active
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.lock();
        PoolStatus {
            name: self.inner.name.clone(),
            active_jobs: state.active,
            max_concurrent: self.inner.max,
            queued_jobs: state.queue.len(),
            total_processed: self.inner.total_processed.load(Ordering::Relaxed),
            total_failed: self.inner.total_failed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("name", &self.inner.name)
            .field("max", &self.inner.max)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_never_exceeds_max() {
        let limiter = Limiter::new("download", 2);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tickets: Vec<_> = (0..8)
            .map(|_| {
                let current = current.clone();
                let peak = peak.clone();
                limiter.run(async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for ticket in tickets {
            ticket.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(limiter.active(), 0);
        assert_eq!(limiter.status().total_processed, 8);
    }

    #[tokio::test]
    async fn test_fifo_start_order() {
        let limiter = Limiter::new("convert", 1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let tickets: Vec<_> = (0..5)
            .map(|i| {
                let order = order.clone();
                limiter.run(async move {
                    order.lock().unwrap().push(i);
                    tokio::task::yield_now().await;
                    i * 10
                })
            })
            .collect();

        let mut results = Vec::new();
        for ticket in tickets {
            results.push(ticket.await.unwrap());
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(results, vec![0, 10, 20, 30, 40]);
    }

    #[tokio::test]
    async fn test_errors_reach_only_their_caller() {
        let limiter = Limiter::new("enrich", 2);
        let ok = limiter.run(async { Ok::<_, String>(1) });
        let failing = limiter.run(async { Err::<i32, _>("lookup failed".to_string()) });
        let ok_again = limiter.run(async { Ok::<_, String>(3) });

        assert_eq!(ok.await.unwrap(), Ok(1));
        assert_eq!(failing.await.unwrap(), Err("lookup failed".to_string()));
        assert_eq!(ok_again.await.unwrap(), Ok(3));
    }

    #[tokio::test]
    async fn test_panicking_task_frees_its_slot() {
        let limiter = Limiter::new("convert", 1);
        let panicking = limiter.run(async {
            if true {
                panic!("converter blew up");
            }
            0
        });
        let next = limiter.run(async { 7 });

        assert_eq!(panicking.await, Err(LimiterError::Aborted));
        assert_eq!(next.await, Ok(7));
        assert_eq!(limiter.active(), 0);
        assert_eq!(limiter.status().total_failed, 1);
    }

    #[tokio::test]
    async fn test_queued_status_is_visible_immediately() {
        let limiter = Limiter::new("download", 1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = limiter.run(async move {
            let _ = release_rx.await;
        });
        let second = limiter.run(async {});
        let third = limiter.run(async {});

        let status = limiter.status();
        assert_eq!(status.name, "download");
        assert_eq!(status.active_jobs, 1);
        assert_eq!(status.queued_jobs, 2);

        release_tx.send(()).unwrap();
        first.await.unwrap();
        second.await.unwrap();
        third.await.unwrap();
        assert_eq!(limiter.queued(), 0);
    }

    #[test]
    fn test_zero_max_is_clamped() {
        let limiter = Limiter::new("x", 0);
        assert_eq!(limiter.max_concurrent(), 1);
    }
}
