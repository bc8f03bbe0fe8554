//! Drives one job from queued to a terminal status.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::RunnerError;
use super::metadata::{MetadataEnricher, MetadataResolver};
use super::types::RunOutput;
use crate::converter::{ConversionJob, Converter, ConverterError};
use crate::job::{JobCounters, JobHandle, JobPhase, JobRegistry, JobRequest, JobSource, JobStatus};
use crate::metrics;
use crate::pipeline::{find_reusable_output, item_identity, PipelineConfig};
use crate::process::{ProcessContext, ProcessEvent};
use crate::retriever::{RetrievalRequest, Retriever};

/// Runs jobs with the configured tools.
pub struct JobRunner {
    pub(super) registry: Arc<JobRegistry>,
    pub(super) retriever: Arc<dyn Retriever>,
    pub(super) converter: Arc<dyn Converter>,
    pub(super) enricher: Option<Arc<dyn MetadataEnricher>>,
    pub(super) config: PipelineConfig,
}

/// Spawns a task feeding process events to `on_event` until every sender
/// is dropped.
pub(super) fn spawn_event_forwarder<F>(
    mut on_event: F,
) -> (mpsc::UnboundedSender<ProcessEvent>, JoinHandle<()>)
where
    F: FnMut(ProcessEvent) + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            on_event(event);
        }
    });
    (tx, task)
}

/// Skips credited to an item that ended without a file: every hint line it
/// printed, or one when only its failure was classified as a skip.
pub(super) fn unproduced_skips(hints: u32, skip_failure: bool) -> u32 {
    if skip_failure {
        hints.max(1)
    } else {
        hints
    }
}

pub(super) fn to_percent(value: f64) -> u8 {
    value.floor().clamp(0.0, 100.0) as u8
}

impl JobRunner {
    pub fn new(
        registry: Arc<JobRegistry>,
        retriever: Arc<dyn Retriever>,
        converter: Arc<dyn Converter>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry,
            retriever,
            converter,
            enricher: None,
            config,
        }
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn MetadataEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Checks that the converter's tools can be started.
    pub async fn check_tools(&self) -> Result<(), ConverterError> {
        self.converter.validate().await
    }

    /// Runs the job to a terminal status. Cancellation is not an error.
    pub async fn run(&self, job_id: &str) -> Result<(), RunnerError> {
        let handle = self
            .registry
            .handle(job_id)
            .ok_or_else(|| RunnerError::JobNotFound(job_id.to_string()))?;
        let job = handle
            .snapshot()
            .ok_or_else(|| RunnerError::JobNotFound(job_id.to_string()))?;
        if handle.is_canceled() || job.status.is_terminal() {
            debug!(job_id, status = %job.status, "Job not runnable, skipping");
            return Ok(());
        }

        let batch = job.request.is_batch();
        let mode = if batch { "batch" } else { "single" };
        let temp_dir = self.config.job_temp_dir(job_id);
        let started = Instant::now();
        info!(job_id, mode, format = %job.request.format, "Starting job");

        handle.update(|job| {
            job.advance_status(JobStatus::Processing);
        });

        let result = if batch {
            self.run_batch(&handle, &job.request, &temp_dir).await
        } else {
            self.run_single(&handle, &job.request, &temp_dir).await
        };

        self.cleanup(&handle, &temp_dir).await;
        metrics::JOB_DURATION
            .with_label_values(&[mode])
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(output) => {
                let completed = handle.update(|job| {
                    job.result_path = Some(output.result.clone());
                    job.zip_path = output.zip_path.clone();
                    job.set_download_progress(100);
                    job.set_convert_progress(100);
                    job.current_phase = JobPhase::Done;
                    job.advance_status(JobStatus::Completed);
                });
                let status = if completed { "completed" } else { "canceled" };
                metrics::JOBS_FINISHED.with_label_values(&[status]).inc();
                info!(
                    job_id,
                    status,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job finished"
                );
                Ok(())
            }
            Err(e) if e.is_canceled() || handle.is_canceled() => {
                // A process terminated from outside still ends the job as canceled.
                if !handle.is_canceled() {
                    if let Err(cancel_err) = self.registry.cancel(job_id) {
                        warn!(job_id, error = %cancel_err, "Failed to mark job canceled");
                    }
                }
                metrics::JOBS_FINISHED.with_label_values(&["canceled"]).inc();
                info!(job_id, "Job canceled");
                Ok(())
            }
            Err(e) => {
                handle.update(|job| {
                    job.error = Some(e.to_string());
                    job.current_phase = JobPhase::Done;
                    job.advance_status(JobStatus::Error);
                });
                metrics::JOBS_FINISHED.with_label_values(&["error"]).inc();
                error!(job_id, error = %e, "Job failed");
                Err(e)
            }
        }
    }

    async fn run_single(
        &self,
        handle: &JobHandle,
        request: &JobRequest,
        temp_dir: &Path,
    ) -> Result<RunOutput, RunnerError> {
        let job_id = handle.id();
        let identity = item_identity(job_id, 1);
        handle.update(|job| job.counters = JobCounters::with_total(1));

        if let Some(path) =
            find_reusable_output(&self.config.output_dir, &identity, request.format).await
        {
            info!(job_id, path = %path.display(), "Reusing existing output");
            handle.update(|job| {
                job.counters.download_finished();
                job.counters.conversion_finished();
            });
            return Ok(RunOutput::single(path));
        }

        let input = match &request.source {
            JobSource::Local { path } => {
                handle.update(|job| {
                    job.counters.download_finished();
                    job.set_download_progress(100);
                });
                path.clone()
            }
            JobSource::Url { url } => {
                handle.update(|job| {
                    job.advance_status(JobStatus::Downloading);
                    job.current_phase = JobPhase::Downloading;
                });

                let updates = handle.clone();
                let hints = Arc::new(AtomicU32::new(0));
                let hinted = Arc::clone(&hints);
                let (events, forwarder) = spawn_event_forwarder(move |event| match event {
                    ProcessEvent::PercentUpdate { percent, .. } => {
                        updates.update(|job| job.set_download_progress(to_percent(percent)));
                    }
                    ProcessEvent::SkipHint { reason, .. } => {
                        debug!(reason = %reason, "Source reported unavailable");
                        hinted.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => {}
                });
                let ctx = ProcessContext::new(handle.cancel_token())
                    .with_events(events)
                    .with_observer(handle.process_observer());
                let retrieval = RetrievalRequest {
                    job_id: job_id.to_string(),
                    item_id: Some(identity.clone()),
                    url: url.clone(),
                    is_batch: false,
                    selection: None,
                    audio_only: !request.format.is_video(),
                    temp_dir: temp_dir.to_path_buf(),
                    expected_total: Some(1),
                };
                let result = self.retriever.retrieve(retrieval, &ctx).await;
                drop(ctx);
                let _ = forwarder.await;

                let produced = matches!(&result, Ok(output) if !output.files.is_empty());
                if !produced {
                    let skip_failure = matches!(&result, Err(e) if e.skip_reason().is_some());
                    let skipped = unproduced_skips(hints.load(Ordering::SeqCst), skip_failure);
                    if skipped > 0 {
                        handle.update(|job| job.skipped_count += skipped);
                    }
                }

                let output = result?;
                let (skipped, errors) = (output.skipped, output.errors);
                let path = output
                    .files
                    .into_iter()
                    .next()
                    .ok_or(RunnerError::NoOutputs { skipped, errors })?;
                handle.update(|job| {
                    job.counters.download_finished();
                    job.set_download_progress(100);
                });
                path
            }
        };

        if handle.is_canceled() {
            return Err(RunnerError::Canceled);
        }
        handle.update(|job| {
            job.advance_status(JobStatus::Converting);
            job.current_phase = JobPhase::Converting;
        });

        let resolver = MetadataResolver::new(job_id, request.entries.clone(), Vec::new())
            .with_enricher(self.enricher.clone(), 1);
        let metadata = resolver.resolve(1, None, &input).await;

        let updates = handle.clone();
        let (events, forwarder) = spawn_event_forwarder(move |event| {
            if let ProcessEvent::PercentUpdate { percent, .. } = event {
                updates.update(|job| job.set_convert_progress(to_percent(percent)));
            }
        });
        let ctx = ProcessContext::new(handle.cancel_token())
            .with_events(events)
            .with_observer(handle.process_observer());
        let conversion = ConversionJob {
            item_id: identity,
            input_path: input,
            output_dir: self.config.output_dir.clone(),
            format: request.format,
            bitrate_kbps: request.bitrate_kbps,
            metadata: Some(metadata.to_embedded(None)).filter(|m| !m.is_empty()),
            cover_art_path: None,
        };
        let result = self.converter.convert(conversion, &ctx).await;
        drop(ctx);
        let _ = forwarder.await;

        let converted = result?;
        metrics::ITEMS_TOTAL.with_label_values(&["converted"]).inc();
        handle.update(|job| {
            job.counters.conversion_finished();
            job.set_convert_progress(100);
            job.current_phase = JobPhase::Finalizing;
        });
        Ok(RunOutput::single(converted.output_path))
    }

    /// Terminates leftover processes and removes the job's temp directory.
    async fn cleanup(&self, handle: &JobHandle, temp_dir: &Path) {
        let killed = handle.kill_processes();
        if killed > 0 {
            debug!(job_id = handle.id(), killed, "Terminated leftover processes");
        }
        match tokio::fs::remove_dir_all(temp_dir).await {
            Ok(()) => debug!(job_id = handle.id(), "Removed temp directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                job_id = handle.id(),
                path = %temp_dir.display(),
                error = %e,
                "Failed to remove temp directory"
            ),
        }
    }
}
