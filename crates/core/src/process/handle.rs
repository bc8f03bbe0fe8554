//! Handles for spawned child processes.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// A handle to one spawned external process.
///
/// Clones share the same termination request, so the registry can keep a
/// clone while the driver that owns the child watches for the request.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    id: u64,
    label: String,
    pid: Option<u32>,
    terminate: CancellationToken,
}

impl ProcessHandle {
    /// Creates a handle for a process with the given tool label and OS pid.
    pub fn new(label: impl Into<String>, pid: Option<u32>) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            pid,
            terminate: CancellationToken::new(),
        }
    }

    /// Process-unique handle id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Requests termination. The driver owning the child performs the
    /// graceful-then-forceful kill.
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    pub fn is_terminate_requested(&self) -> bool {
        self.terminate.is_cancelled()
    }

    /// Resolves once termination has been requested.
    pub async fn terminate_requested(&self) {
        self.terminate.cancelled().await
    }
}

/// Notified when the driver spawns or reaps a process.
pub trait ProcessObserver: Send + Sync {
    fn on_spawn(&self, handle: &ProcessHandle);
    fn on_exit(&self, handle: &ProcessHandle);
}
