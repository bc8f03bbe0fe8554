//! In-memory job registry.
//!
//! The registry owns every [`Job`] record, the job's cancellation token and
//! the handles of the child processes running on its behalf. Runners mutate
//! their job only through a [`JobHandle`]; every change is broadcast as a
//! [`JobUpdate`].

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::JobError;
use super::types::{Job, JobRequest, JobStatus, JobUpdate};
use crate::process::{ProcessHandle, ProcessObserver};

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
    processes: HashMap<u64, ProcessHandle>,
}

pub struct JobRegistry {
    jobs: RwLock<HashMap<String, JobEntry>>,
    updates: broadcast::Sender<JobUpdate>,
}

impl JobRegistry {
    pub fn new(update_buffer: usize) -> Self {
        let (updates, _) = broadcast::channel(update_buffer.max(1));
        Self {
            jobs: RwLock::new(HashMap::new()),
            updates,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, update: JobUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    /// Creates a queued job. A caller-supplied id of a finished job replaces
    /// that job, which is how an interrupted batch is resumed.
    pub fn create(&self, request: JobRequest, id: Option<String>) -> Result<Job, JobError> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let job = Job::new(id.clone(), request);
        {
            let mut jobs = self.write();
            if let Some(existing) = jobs.get(&id) {
                if !existing.job.status.is_terminal() {
                    return Err(JobError::AlreadyActive(id));
                }
            }
            jobs.insert(
                id.clone(),
                JobEntry {
                    job: job.clone(),
                    cancel: CancellationToken::new(),
                    processes: HashMap::new(),
                },
            );
        }
        info!(job_id = %id, "Created job");
        self.publish(JobUpdate::Changed {
            job: Box::new(job.clone()),
        });
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.read().get(id).map(|entry| entry.job.clone())
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.read().values().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobUpdate> {
        self.updates.subscribe()
    }

    pub fn cancel_token(&self, id: &str) -> Option<CancellationToken> {
        self.read().get(id).map(|entry| entry.cancel.clone())
    }

    /// True when the job is unknown or canceled.
    pub fn is_canceled(&self, id: &str) -> bool {
        self.read().get(id).map(|e| e.job.canceled).unwrap_or(true)
    }

    /// Handle for the runner of `id`.
    pub fn handle(self: &Arc<Self>, id: &str) -> Option<JobHandle> {
        let cancel = self.cancel_token(id)?;
        Some(JobHandle {
            registry: Arc::clone(self),
            job_id: id.to_string(),
            cancel,
        })
    }

    /// Attaches a child process to a job. A process registered after the
    /// job was canceled is asked to terminate at once.
    pub fn register_process(&self, job_id: &str, handle: ProcessHandle) -> bool {
        let mut jobs = self.write();
        match jobs.get_mut(job_id) {
            Some(entry) if !entry.job.canceled => {
                debug!(job_id, process = handle.id(), label = handle.label(), "Registered process");
                entry.processes.insert(handle.id(), handle);
                true
            }
            _ => {
                handle.terminate();
                false
            }
        }
    }

    pub fn unregister_process(&self, job_id: &str, handle_id: u64) {
        if let Some(entry) = self.write().get_mut(job_id) {
            entry.processes.remove(&handle_id);
        }
    }

    pub fn process_count(&self, job_id: &str) -> usize {
        self.read()
            .get(job_id)
            .map(|e| e.processes.len())
            .unwrap_or(0)
    }

    /// Requests termination of every process of the job and forgets them.
    /// Returns how many were signaled.
    pub fn kill_processes(&self, job_id: &str) -> usize {
        let handles: Vec<ProcessHandle> = match self.write().get_mut(job_id) {
            Some(entry) => entry.processes.drain().map(|(_, h)| h).collect(),
            None => return 0,
        };
        for handle in &handles {
            debug!(job_id, process = handle.id(), pid = ?handle.pid(), "Terminating process");
            handle.terminate();
        }
        handles.len()
    }

    /// Marks the job canceled and fires its token. Finished jobs are left
    /// untouched.
    pub fn cancel(&self, job_id: &str) -> Result<Job, JobError> {
        let job = {
            let mut jobs = self.write();
            let entry = jobs
                .get_mut(job_id)
                .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
            if entry.job.status.is_terminal() {
                return Ok(entry.job.clone());
            }
            entry.job.canceled = true;
            entry.job.advance_status(JobStatus::Canceled);
            entry.job.error = None;
            entry.job.updated_at = Utc::now();
            entry.cancel.cancel();
            entry.job.clone()
        };
        info!(job_id, "Canceled job");
        self.publish(JobUpdate::Changed {
            job: Box::new(job.clone()),
        });
        Ok(job)
    }

    /// Removes a finished job.
    pub fn remove(&self, job_id: &str) -> Option<Job> {
        let removed = {
            let mut jobs = self.write();
            match jobs.get(job_id) {
                Some(entry) if entry.job.status.is_terminal() => jobs.remove(job_id),
                _ => None,
            }
        };
        let job = removed?.job;
        self.publish(JobUpdate::Removed {
            job_id: job.id.clone(),
        });
        Some(job)
    }

    /// Drops completed jobs none of whose output files exist anymore.
    pub fn prune_missing_outputs(&self) -> usize {
        let stale: Vec<String> = self
            .read()
            .values()
            .filter(|entry| {
                let job = &entry.job;
                job.status == JobStatus::Completed
                    && job.output_paths().iter().all(|path| !path.exists())
            })
            .map(|entry| entry.job.id.clone())
            .collect();

        let removed = stale
            .iter()
            .filter(|id| self.remove(id).is_some())
            .count();
        if removed > 0 {
            info!(removed, "Pruned jobs with missing outputs");
        }
        removed
    }

    fn update_job<F>(&self, job_id: &str, apply: F) -> bool
    where
        F: FnOnce(&mut Job),
    {
        let job = {
            let mut jobs = self.write();
            let Some(entry) = jobs.get_mut(job_id) else {
                return false;
            };
            if entry.job.canceled || entry.job.status.is_terminal() {
                return false;
            }
            apply(&mut entry.job);
            entry.job.updated_at = Utc::now();
            entry.job.clone()
        };
        self.publish(JobUpdate::Changed { job: Box::new(job) });
        true
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A runner's write access to one job.
#[derive(Clone)]
pub struct JobHandle {
    registry: Arc<JobRegistry>,
    job_id: String,
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.job_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn snapshot(&self) -> Option<Job> {
        self.registry.get(&self.job_id)
    }

    /// Applies `apply` to the job. No-op (returns false) once the job is
    /// canceled or finished.
    pub fn update<F>(&self, apply: F) -> bool
    where
        F: FnOnce(&mut Job),
    {
        self.registry.update_job(&self.job_id, apply)
    }

    /// Terminates and forgets every process still registered for the job.
    pub fn kill_processes(&self) -> usize {
        self.registry.kill_processes(&self.job_id)
    }

    /// Observer that registers spawned processes with this job.
    pub fn process_observer(&self) -> Arc<dyn ProcessObserver> {
        Arc::new(JobProcesses {
            registry: Arc::clone(&self.registry),
            job_id: self.job_id.clone(),
        })
    }
}

struct JobProcesses {
    registry: Arc<JobRegistry>,
    job_id: String,
}

impl ProcessObserver for JobProcesses {
    fn on_spawn(&self, handle: &ProcessHandle) {
        self.registry.register_process(&self.job_id, handle.clone());
    }

    fn on_exit(&self, handle: &ProcessHandle) {
        self.registry.unregister_process(&self.job_id, handle.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::OutputFormat;
    use crate::job::ResultPath;
    use tempfile::TempDir;

    fn request() -> JobRequest {
        JobRequest::url("https://example.com/v", OutputFormat::Mp3)
    }

    #[test]
    fn test_create_and_get() {
        let registry = JobRegistry::default();
        let job = registry.create(request(), None).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(registry.get(&job.id).unwrap().id, job.id);
        assert_eq!(registry.list().len(), 1);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_create_with_active_id_fails() {
        let registry = Arc::new(JobRegistry::default());
        registry.create(request(), Some("fixed".into())).unwrap();
        let err = registry.create(request(), Some("fixed".into())).unwrap_err();
        assert!(matches!(err, JobError::AlreadyActive(_)));

        // Once finished the id can be reused.
        let handle = registry.handle("fixed").unwrap();
        handle.update(|job| {
            job.advance_status(JobStatus::Processing);
            job.advance_status(JobStatus::Error);
        });
        let job = registry.create(request(), Some("fixed".into())).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(!registry.handle("fixed").unwrap().is_canceled());
    }

    #[test]
    fn test_cancel_sets_terminal_state_and_token() {
        let registry = Arc::new(JobRegistry::default());
        let job = registry.create(request(), None).unwrap();
        let handle = registry.handle(&job.id).unwrap();
        handle.update(|job| {
            job.advance_status(JobStatus::Downloading);
            job.error = Some("transient".into());
        });

        let canceled = registry.cancel(&job.id).unwrap();
        assert!(canceled.canceled);
        assert_eq!(canceled.status, JobStatus::Canceled);
        assert!(canceled.error.is_none());
        assert!(handle.is_canceled());

        // Runner writes after cancel are dropped.
        assert!(!handle.update(|job| job.set_download_progress(90)));
        assert_eq!(registry.get(&job.id).unwrap().download_progress, 0);
    }

    #[test]
    fn test_cancel_finished_job_is_noop() {
        let registry = Arc::new(JobRegistry::default());
        let job = registry.create(request(), None).unwrap();
        let handle = registry.handle(&job.id).unwrap();
        handle.update(|job| {
            job.advance_status(JobStatus::Processing);
            job.advance_status(JobStatus::Completed);
        });

        let after = registry.cancel(&job.id).unwrap();
        assert_eq!(after.status, JobStatus::Completed);
        assert!(!after.canceled);
        assert!(!handle.is_canceled());
        assert!(matches!(registry.cancel("nope"), Err(JobError::NotFound(_))));
    }

    #[test]
    fn test_process_registration() {
        let registry = Arc::new(JobRegistry::default());
        let job = registry.create(request(), None).unwrap();
        let handles: Vec<ProcessHandle> =
            (0..3).map(|_| ProcessHandle::new("yt-dlp", None)).collect();
        for handle in &handles {
            assert!(registry.register_process(&job.id, handle.clone()));
        }
        assert_eq!(registry.process_count(&job.id), 3);

        registry.unregister_process(&job.id, handles[0].id());
        assert_eq!(registry.kill_processes(&job.id), 2);
        assert!(!handles[0].is_terminate_requested());
        assert!(handles[1].is_terminate_requested());
        assert!(handles[2].is_terminate_requested());
        assert_eq!(registry.process_count(&job.id), 0);
    }

    #[test]
    fn test_register_after_cancel_terminates() {
        let registry = Arc::new(JobRegistry::default());
        let job = registry.create(request(), None).unwrap();
        registry.cancel(&job.id).unwrap();

        let late = ProcessHandle::new("ffmpeg", None);
        assert!(!registry.register_process(&job.id, late.clone()));
        assert!(late.is_terminate_requested());
    }

    #[tokio::test]
    async fn test_updates_are_broadcast() {
        let registry = Arc::new(JobRegistry::default());
        let mut rx = registry.subscribe();
        let job = registry.create(request(), None).unwrap();
        registry
            .handle(&job.id)
            .unwrap()
            .update(|job| {
                job.advance_status(JobStatus::Processing);
            });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.job_id(), job.id);
        match rx.recv().await.unwrap() {
            JobUpdate::Changed { job } => assert_eq!(job.status, JobStatus::Processing),
            other => panic!("unexpected update: {:?}", other),
        }
    }

    #[test]
    fn test_prune_missing_outputs() {
        let dir = TempDir::new().unwrap();
        let kept = dir.path().join("kept.mp3");
        std::fs::write(&kept, b"data").unwrap();

        let registry = Arc::new(JobRegistry::default());
        for (id, path) in [("gone", dir.path().join("gone.mp3")), ("kept", kept)] {
            registry.create(request(), Some(id.into())).unwrap();
            registry.handle(id).unwrap().update(|job| {
                job.advance_status(JobStatus::Processing);
                job.advance_status(JobStatus::Completed);
                job.result_path = Some(ResultPath::Single(path));
            });
        }
        registry.create(request(), Some("running".into())).unwrap();

        assert_eq!(registry.prune_missing_outputs(), 1);
        assert!(registry.get("gone").is_none());
        assert!(registry.get("kept").is_some());
        assert!(registry.get("running").is_some());
    }
}
