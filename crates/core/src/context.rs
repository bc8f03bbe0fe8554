//! Application context.
//!
//! Owns the job registry, the dispatch queue and the runner. Everything that
//! submits, inspects or cancels jobs goes through one [`AppContext`].

use anyhow::Context as _;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::converter::{Converter, ConverterError, FfmpegConverter};
use crate::dispatch::DispatchQueue;
use crate::job::{Job, JobError, JobRegistry, JobRequest};
use crate::process::ProcessDriver;
use crate::retriever::{Retriever, YtDlpRetriever};
use crate::runner::{JobRunner, MetadataEnricher};

/// What a cancel request did.
#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub job: Job,
    /// Not-yet-started dispatch entries dropped.
    pub removed_from_queue: usize,
    /// Child processes asked to terminate.
    pub processes_signaled: usize,
}

/// Dispatch queue state for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub running: bool,
    pub pending: Vec<String>,
}

pub struct AppContext {
    config: Config,
    registry: Arc<JobRegistry>,
    dispatch: DispatchQueue,
    runner: Arc<JobRunner>,
}

impl AppContext {
    /// Builds a context around the given tools.
    pub fn new(
        config: Config,
        retriever: Arc<dyn Retriever>,
        converter: Arc<dyn Converter>,
        enricher: Option<Arc<dyn MetadataEnricher>>,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new(config.jobs.update_buffer));
        let mut runner = JobRunner::new(
            Arc::clone(&registry),
            retriever,
            converter,
            config.pipeline.clone(),
        );
        if let Some(enricher) = enricher {
            runner = runner.with_enricher(enricher);
        }

        let jobs = Arc::clone(&registry);
        let dispatch = DispatchQueue::new(move |job_id| jobs.is_canceled(job_id));

        Self {
            config,
            registry,
            dispatch,
            runner: Arc::new(runner),
        }
    }

    /// Builds a context driving yt-dlp and ffmpeg as configured.
    pub fn from_config(config: Config) -> Self {
        let driver = ProcessDriver::new(config.pipeline.kill_grace());
        let retriever = YtDlpRetriever::new(config.retriever.clone(), driver.clone());
        let converter = FfmpegConverter::new(config.converter.clone(), driver);
        Self::new(config, Arc::new(retriever), Arc::new(converter), None)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn dispatch(&self) -> &DispatchQueue {
        &self.dispatch
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    /// Creates a job and queues it for running.
    pub fn submit(&self, request: JobRequest, id: Option<String>) -> Result<Job, JobError> {
        let job = self.registry.create(request, id)?;
        let runner = Arc::clone(&self.runner);
        let job_id = job.id.clone();
        self.dispatch.enqueue(job.id.clone(), move || async move {
            runner
                .run(&job_id)
                .await
                .with_context(|| format!("running job {}", job_id))
        });
        Ok(job)
    }

    /// Cancels a job: drops its pending start, marks it canceled and asks
    /// every registered process to terminate.
    pub fn cancel_job(&self, job_id: &str) -> Result<CancelOutcome, JobError> {
        let removed_from_queue = self.dispatch.remove_from_queue(job_id);
        let job = self.registry.cancel(job_id)?;
        let processes_signaled = self.registry.kill_processes(job_id);
        info!(
            job_id,
            removed_from_queue,
            processes_signaled,
            "Cancel requested"
        );
        Ok(CancelOutcome {
            job,
            removed_from_queue,
            processes_signaled,
        })
    }

    /// Checks that the external tools can be started.
    pub async fn check_tools(&self) -> Result<(), ConverterError> {
        self.runner.check_tools().await
    }

    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            running: self.dispatch.is_running(),
            pending: self.dispatch.pending_ids(),
        }
    }
}
