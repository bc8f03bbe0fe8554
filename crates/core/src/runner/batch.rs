//! Batch (playlist) jobs.
//!
//! Enumerable playlists become one work item per entry, each downloaded by
//! its own retriever invocation. Otherwise a single invocation fetches the
//! whole playlist and every announced file is fed straight to the convert
//! stage.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::archive::write_archive;
use super::error::RunnerError;
use super::metadata::{provider_entry_for, MetadataResolver};
use super::runner::{spawn_event_forwarder, unproduced_skips, JobRunner};
use super::types::{RunOutput, WorkItem};
use crate::converter::{ConversionJob, Converter, OutputFormat};
use crate::job::{
    Job, JobCounters, JobHandle, JobPhase, JobRequest, JobSource, JobStatus, PlaylistProgress,
    ResultPath,
};
use crate::metrics;
use crate::pipeline::{
    find_reusable_output, item_identity, DownloadConvertQueue, DownloadOutcome, ItemOutcome,
    ItemStages, StageProgress,
};
use crate::process::{ProcessContext, ProcessEvent, SkipReason};
use crate::retriever::naming::parse_output_name;
use crate::retriever::{EntryInfo, RetrievalRequest, Retriever, SourceInfo};

/// Batch progress. The job record is written while this is locked, so
/// concurrent items never publish counters out of order.
struct BatchProgress {
    download: StageProgress,
    convert: StageProgress,
    counters: JobCounters,
    playlist: PlaylistProgress,
    skipped: u32,
    errors: u32,
}

impl BatchProgress {
    fn new(total: u32) -> Self {
        Self {
            download: StageProgress::new(total),
            convert: StageProgress::new(total),
            counters: JobCounters::with_total(total),
            playlist: PlaylistProgress::new(total),
            skipped: 0,
            errors: 0,
        }
    }

    fn download_done(&mut self, index: u32) {
        self.counters.download_finished();
        self.download.set_total(self.counters.dl_total);
        self.download.complete(index);
    }

    fn conversion_dropped(&mut self, index: u32) {
        self.counters.conversion_dropped();
        self.convert.abandon(index);
        self.convert.set_total(self.counters.cv_total);
    }

    /// An item of a whole-playlist invocation that ended without a file:
    /// its download is over and it leaves the convert stage.
    fn item_unproduced(&mut self) {
        self.counters.download_finished();
        self.download.set_total(self.counters.dl_total);
        self.download.count_done();
        self.counters.conversion_dropped();
        self.convert.set_total(self.counters.cv_total);
        self.playlist.item_finished();
    }

    fn item_skipped(&mut self) {
        self.skipped += 1;
        self.item_unproduced();
    }

    fn item_failed(&mut self) {
        self.errors += 1;
        self.item_unproduced();
    }

    fn item_finished(&mut self, index: u32, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Converted { .. } | ItemOutcome::Reused { .. } => {
                self.counters.conversion_finished();
                self.convert.set_total(self.counters.cv_total);
                self.convert.complete(index);
            }
            ItemOutcome::Skipped { .. } => self.conversion_dropped(index),
            ItemOutcome::Failed { .. } => {
                self.errors += 1;
                self.conversion_dropped(index);
            }
            ItemOutcome::Canceled => {
                self.convert.abandon(index);
                return;
            }
        }
        self.playlist.item_finished();
    }

    fn apply_to(&self, job: &mut Job) {
        job.counters = self.counters;
        job.playlist = Some(self.playlist.clone());
        job.skipped_count = self.skipped;
        job.errors_count = self.errors;
        job.set_download_progress(self.download.percent());
        job.set_convert_progress(self.convert.percent());
    }
}

struct BatchTracker {
    handle: JobHandle,
    progress: Mutex<BatchProgress>,
}

impl BatchTracker {
    fn new(handle: JobHandle, total: u32) -> Self {
        Self {
            handle,
            progress: Mutex::new(BatchProgress::new(total)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BatchProgress> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update<F>(&self, apply: F)
    where
        F: FnOnce(&mut BatchProgress),
    {
        let mut progress = self.lock();
        apply(&mut progress);
        self.handle.update(|job| progress.apply_to(job));
    }

    fn totals(&self) -> (u32, u32) {
        let progress = self.lock();
        (progress.skipped, progress.errors)
    }
}

/// Per-item stages of a batch job.
pub(super) struct BatchStages {
    handle: JobHandle,
    retriever: Arc<dyn Retriever>,
    converter: Arc<dyn Converter>,
    metadata: MetadataResolver,
    tracker: Arc<BatchTracker>,
    url: String,
    format: OutputFormat,
    bitrate_kbps: Option<u32>,
    output_dir: PathBuf,
    temp_dir: PathBuf,
}

impl BatchStages {
    fn context(&self, events: mpsc::UnboundedSender<ProcessEvent>) -> ProcessContext {
        ProcessContext::new(self.handle.cancel_token())
            .with_events(events)
            .with_observer(self.handle.process_observer())
    }

    fn finish_item(&self, index: u32, outcome: &ItemOutcome) {
        metrics::ITEMS_TOTAL
            .with_label_values(&[outcome.as_str()])
            .inc();
        self.tracker.update(|p| p.item_finished(index, outcome));
    }

    fn set_current(&self, title: Option<&str>) {
        if let Some(title) = title {
            self.tracker
                .update(|p| p.playlist.current = Some(title.to_string()));
        }
    }
}

#[async_trait]
impl ItemStages for BatchStages {
    type Item = WorkItem;

    async fn download(&self, index: u32, item: &WorkItem) -> DownloadOutcome {
        let job_id = self.handle.id();
        let identity = item_identity(job_id, index);
        if let Some(path) = find_reusable_output(&self.output_dir, &identity, self.format).await {
            debug!(job_id, index, path = %path.display(), "Reusing existing output");
            return DownloadOutcome::Finished(ItemOutcome::Reused { path });
        }
        self.set_current(item.title());

        let hints = Arc::new(AtomicU32::new(0));
        let tracker = Arc::clone(&self.tracker);
        let hinted = Arc::clone(&hints);
        let (events, forwarder) = spawn_event_forwarder(move |event| match event {
            ProcessEvent::PercentUpdate { percent, .. } => {
                tracker.update(|p| {
                    p.download.update(index, percent / 100.0);
                });
            }
            ProcessEvent::SkipHint { .. } => {
                hinted.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        });

        // Entries without their own URL are fetched by playlist position.
        let (url, is_batch, selection) = match item.entry.as_ref().and_then(|e| e.url.clone()) {
            Some(url) => (url, false, None),
            None => (self.url.clone(), true, Some(vec![index])),
        };
        let request = RetrievalRequest {
            job_id: job_id.to_string(),
            item_id: Some(identity),
            url,
            is_batch,
            selection,
            audio_only: !self.format.is_video(),
            temp_dir: self.temp_dir.clone(),
            expected_total: Some(1),
        };

        let ctx = self.context(events);
        let result = self.retriever.retrieve(request, &ctx).await;
        drop(ctx);
        let _ = forwarder.await;

        let outcome = match result {
            Ok(output) => match output.files.into_iter().next() {
                Some(path) => DownloadOutcome::Downloaded(path),
                None if output.skipped > 0 => DownloadOutcome::Finished(ItemOutcome::Skipped {
                    reason: output
                        .skip_reasons
                        .first()
                        .copied()
                        .unwrap_or(SkipReason::Unavailable),
                }),
                None => DownloadOutcome::Finished(ItemOutcome::Failed {
                    error: "retrieval produced no file".to_string(),
                }),
            },
            Err(e) if e.is_canceled() => DownloadOutcome::Finished(ItemOutcome::Canceled),
            Err(e) => match e.skip_reason() {
                Some(reason) => {
                    info!(job_id, index, reason = %reason, "Skipping unavailable item");
                    DownloadOutcome::Finished(ItemOutcome::Skipped { reason })
                }
                None => {
                    warn!(job_id, index, error = %e, "Item download failed");
                    DownloadOutcome::Finished(ItemOutcome::Failed {
                        error: e.to_string(),
                    })
                }
            },
        };

        // Hints only count for items that ended without a file.
        if let DownloadOutcome::Finished(
            finished @ (ItemOutcome::Skipped { .. } | ItemOutcome::Failed { .. }),
        ) = &outcome
        {
            let skipped = unproduced_skips(
                hints.load(Ordering::SeqCst),
                matches!(finished, ItemOutcome::Skipped { .. }),
            );
            if skipped > 0 {
                self.tracker.update(|p| p.skipped += skipped);
            }
        }
        outcome
    }

    async fn item_downloaded(&self, index: u32, _item: &WorkItem, outcome: &DownloadOutcome) {
        match outcome {
            DownloadOutcome::Finished(ItemOutcome::Canceled) => {
                self.tracker.update(|p| {
                    p.download.abandon(index);
                });
            }
            _ => self.tracker.update(|p| p.download_done(index)),
        }
        if let DownloadOutcome::Finished(outcome) = outcome {
            self.finish_item(index, outcome);
        }
    }

    async fn convert(&self, index: u32, item: WorkItem, input: PathBuf) -> ItemOutcome {
        let job_id = self.handle.id();
        let identity = item_identity(job_id, index);
        if let Some(path) = find_reusable_output(&self.output_dir, &identity, self.format).await {
            debug!(job_id, index, path = %path.display(), "Reusing existing output");
            let outcome = ItemOutcome::Reused { path };
            self.finish_item(index, &outcome);
            return outcome;
        }

        self.handle.update(|job| {
            job.advance_status(JobStatus::Converting);
            job.current_phase = JobPhase::Converting;
        });
        let metadata = self
            .metadata
            .resolve(index, item.entry.as_ref(), &input)
            .await;
        self.set_current(metadata.title.as_deref());

        let tracker = Arc::clone(&self.tracker);
        let (events, forwarder) = spawn_event_forwarder(move |event| {
            if let ProcessEvent::PercentUpdate { percent, .. } = event {
                tracker.update(|p| {
                    p.convert.update(index, percent / 100.0);
                });
            }
        });
        let conversion = ConversionJob {
            item_id: identity,
            input_path: input.clone(),
            output_dir: self.output_dir.clone(),
            format: self.format,
            bitrate_kbps: self.bitrate_kbps,
            metadata: Some(metadata.to_embedded(Some(index))),
            cover_art_path: None,
        };

        let ctx = self.context(events);
        let result = self.converter.convert(conversion, &ctx).await;
        drop(ctx);
        let _ = forwarder.await;

        let outcome = match result {
            Ok(converted) => {
                if let Err(e) = tokio::fs::remove_file(&input).await {
                    debug!(job_id, index, error = %e, "Could not remove downloaded input");
                }
                ItemOutcome::Converted {
                    path: converted.output_path,
                }
            }
            Err(e) if e.is_canceled() => ItemOutcome::Canceled,
            Err(e) => {
                warn!(job_id, index, error = %e, "Item conversion failed");
                ItemOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };
        self.finish_item(index, &outcome);
        outcome
    }
}

/// Normalizes a selection: positive, sorted, unique; `None` when empty.
fn normalize_selection(selection: Option<&Vec<u32>>) -> Option<Vec<u32>> {
    let mut selection: Vec<u32> = selection?.iter().copied().filter(|i| *i > 0).collect();
    selection.sort_unstable();
    selection.dedup();
    (!selection.is_empty()).then_some(selection)
}

/// Turns files announced by a whole-playlist invocation into work items.
struct PlaylistFeeder<'a> {
    job_id: &'a str,
    entries: &'a [EntryInfo],
    tracker: &'a BatchTracker,
    queue: &'a DownloadConvertQueue<BatchStages>,
    seen: HashSet<PathBuf>,
    announced: u32,
    skips: u32,
    failures: u32,
}

impl PlaylistFeeder<'_> {
    fn handle(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::FileDone { path, .. } => self.file_done(path),
            ProcessEvent::PercentUpdate {
                overall: Some(overall),
                ..
            } => self.tracker.update(|p| {
                p.download.set_percent(overall);
            }),
            ProcessEvent::SkipHint { reason, .. } => {
                debug!(job_id = self.job_id, reason = %reason, "Playlist item unavailable");
                self.skips += 1;
                self.tracker.update(BatchProgress::item_skipped);
            }
            ProcessEvent::Summary {
                skipped, errors, ..
            } => self.reconcile(skipped, errors),
            _ => {}
        }
    }

    /// Accounts for skipped and failed items the invocation reported but no
    /// event has covered yet.
    fn reconcile(&mut self, skipped: u32, errors: u32) {
        while self.skips < skipped {
            self.skips += 1;
            self.tracker.update(BatchProgress::item_skipped);
        }
        while self.failures < errors {
            self.failures += 1;
            self.tracker.update(BatchProgress::item_failed);
        }
    }

    fn file_done(&mut self, path: PathBuf) {
        if !self.seen.insert(path.clone()) {
            return;
        }
        self.announced += 1;
        let parsed = parse_output_name(self.job_id, &path);
        let index = parsed.index.unwrap_or(self.announced);
        let entry = provider_entry_for(self.entries, index, parsed.id.as_deref()).cloned();
        self.tracker.update(|p| p.download_done(index));
        self.queue
            .enqueue_downloaded(index, WorkItem::new(index, entry), path);
    }
}

impl JobRunner {
    pub(super) async fn run_batch(
        &self,
        handle: &JobHandle,
        request: &JobRequest,
        temp_dir: &Path,
    ) -> Result<RunOutput, RunnerError> {
        let job_id = handle.id();
        let JobSource::Url { url } = &request.source else {
            return Err(RunnerError::Internal(
                "batch job without a URL source".to_string(),
            ));
        };

        handle.update(|job| job.current_phase = JobPhase::Probing);
        let probe_ctx =
            ProcessContext::new(handle.cancel_token()).with_observer(handle.process_observer());
        let info = match self.retriever.probe(url, &probe_ctx).await {
            Ok(info) => info,
            Err(e) if e.is_canceled() => return Err(RunnerError::Canceled),
            Err(e) => {
                warn!(job_id, error = %e, "Probe failed, continuing without playlist details");
                SourceInfo::default()
            }
        };

        let selection = normalize_selection(request.selection.as_ref());
        // Listed entries are what gets queued, so they win over the
        // provider's own count.
        let total = selection
            .as_ref()
            .map(|s| s.len() as u32)
            .or_else(|| (!info.entries.is_empty()).then_some(info.entries.len() as u32))
            .or(info.entry_count)
            .unwrap_or(0);

        let items: Option<Vec<WorkItem>> = match &selection {
            Some(selection) => Some(
                selection
                    .iter()
                    .map(|index| {
                        WorkItem::new(*index, provider_entry_for(&info.entries, *index, None).cloned())
                    })
                    .collect(),
            ),
            None if !info.entries.is_empty() => Some(
                info.entries
                    .iter()
                    .map(|entry| WorkItem::new(entry.index, Some(entry.clone())))
                    .collect(),
            ),
            None => None,
        };

        handle.update(|job| {
            job.metadata.title = info.title.clone();
            job.metadata.uploader = info.uploader.clone();
            job.metadata.item_count = (total > 0).then_some(total);
            job.counters = JobCounters::with_total(total);
            job.playlist = Some(PlaylistProgress::new(total));
            job.advance_status(JobStatus::Downloading);
            job.current_phase = JobPhase::Downloading;
        });
        info!(job_id, total, enumerable = items.is_some(), "Starting batch");

        let tracker = Arc::new(BatchTracker::new(handle.clone(), total));
        let stages = BatchStages {
            handle: handle.clone(),
            retriever: Arc::clone(&self.retriever),
            converter: Arc::clone(&self.converter),
            metadata: MetadataResolver::new(job_id, request.entries.clone(), info.entries.clone())
                .with_album(info.title.clone())
                .with_enricher(self.enricher.clone(), self.config.enrich_concurrency),
            tracker: Arc::clone(&tracker),
            url: url.clone(),
            format: request.format,
            bitrate_kbps: request.bitrate_kbps,
            output_dir: self.config.output_dir.clone(),
            temp_dir: temp_dir.to_path_buf(),
        };
        let queue = DownloadConvertQueue::new(
            stages,
            self.config.download_concurrency,
            self.config.convert_concurrency,
            handle.cancel_token(),
        );

        let fed = match items {
            Some(items) => {
                for item in items {
                    queue.enqueue(item.index, item);
                }
                Ok(())
            }
            None => {
                self.retrieve_playlist(handle, &queue, &tracker, &info, url, request, temp_dir, total)
                    .await
            }
        };
        queue.end();
        fed?;

        queue.wait_for_idle().await;
        if handle.is_canceled() {
            return Err(RunnerError::Canceled);
        }

        let outputs: Vec<PathBuf> = queue
            .results()
            .iter()
            .filter_map(|r| r.outcome.output().map(Path::to_path_buf))
            .collect();
        let (skipped, errors) = tracker.totals();
        if outputs.is_empty() {
            return Err(RunnerError::NoOutputs { skipped, errors });
        }
        info!(job_id, outputs = outputs.len(), skipped, errors, "Batch items finished");

        handle.update(|job| job.current_phase = JobPhase::Finalizing);
        let zip_path = if self.config.archive_batches {
            let dest = self.config.output_dir.join(format!("{}.zip", job_id));
            match write_archive(dest, outputs.clone()).await {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(job_id, error = %e, "Failed to write batch archive");
                    None
                }
            }
        } else {
            None
        };

        Ok(RunOutput {
            result: ResultPath::Many(outputs),
            zip_path,
        })
    }

    /// One retriever invocation for the whole playlist, feeding each file
    /// to the convert stage as soon as it is announced.
    #[allow(clippy::too_many_arguments)]
    async fn retrieve_playlist(
        &self,
        handle: &JobHandle,
        queue: &DownloadConvertQueue<BatchStages>,
        tracker: &BatchTracker,
        info: &SourceInfo,
        url: &str,
        request: &JobRequest,
        temp_dir: &Path,
        total: u32,
    ) -> Result<(), RunnerError> {
        let job_id = handle.id();
        let (events, mut rx) = mpsc::unbounded_channel();
        let ctx = ProcessContext::new(handle.cancel_token())
            .with_events(events)
            .with_observer(handle.process_observer());
        let retrieval = RetrievalRequest {
            job_id: job_id.to_string(),
            item_id: None,
            url: url.to_string(),
            is_batch: true,
            selection: None,
            audio_only: !request.format.is_video(),
            temp_dir: temp_dir.to_path_buf(),
            expected_total: (total > 0).then_some(total),
        };

        let mut feeder = PlaylistFeeder {
            job_id,
            entries: &info.entries,
            tracker,
            queue,
            seen: HashSet::new(),
            announced: 0,
            skips: 0,
            failures: 0,
        };

        let result = {
            let retrieval = self.retriever.retrieve(retrieval, &ctx);
            tokio::pin!(retrieval);
            loop {
                tokio::select! {
                    result = &mut retrieval => break result,
                    Some(event) = rx.recv() => feeder.handle(event),
                }
            }
        };
        drop(ctx);
        while let Some(event) = rx.recv().await {
            feeder.handle(event);
        }

        match result {
            Ok(output) => {
                for path in output.files {
                    feeder.file_done(path);
                }
                feeder.reconcile(output.skipped, output.errors);
                Ok(())
            }
            Err(e) if e.is_canceled() => Err(RunnerError::Canceled),
            Err(e) => {
                let (skipped, errors) = e.item_tallies();
                feeder.reconcile(skipped, errors);
                if feeder.announced > 0 {
                    warn!(job_id, error = %e, "Playlist retrieval ended with an error");
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
        }
    }
}
