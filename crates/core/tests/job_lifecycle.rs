//! Job lifecycle integration tests.
//!
//! These tests drive whole jobs through the application context with mock
//! tools:
//! - Playlist fan-out with bounded download and convert stages
//! - Skipped and failed items
//! - Reuse of existing outputs and resuming a job
//! - Cancellation of running processes
//! - Progress invariants on every published update

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast::error::TryRecvError;

use fetchcast_core::{
    converter::ConverterError,
    job::{JobUpdate, ResultPath},
    process::SkipReason,
    retriever::SourceInfo,
    testing::{fixtures, MockConverter, MockItem, MockRetriever},
    AppContext, Config, Job, JobRequest, JobStatus, OutputFormat,
};

const PLAYLIST_URL: &str = "https://media.example/playlist?list=PL0123";

/// Test helper wiring an application context to mock tools.
struct TestHarness {
    ctx: AppContext,
    retriever: Arc<MockRetriever>,
    converter: Arc<MockConverter>,
    output_dir: PathBuf,
    _dirs: TempDir,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_concurrency(2, 2)
    }

    fn with_concurrency(download: usize, convert: usize) -> Self {
        let dirs = TempDir::new().expect("Failed to create temp dir");
        let output_dir = dirs.path().join("out");
        std::fs::create_dir_all(&output_dir).expect("Failed to create output dir");

        let mut config = Config::default();
        config.pipeline = config
            .pipeline
            .with_dirs(output_dir.clone(), dirs.path().join("tmp"))
            .with_concurrency(download, convert);

        let retriever = Arc::new(MockRetriever::new());
        let converter = Arc::new(MockConverter::new());
        let ctx = AppContext::new(config, retriever.clone(), converter.clone(), None);

        Self {
            ctx,
            retriever,
            converter,
            output_dir,
            _dirs: dirs,
        }
    }

    fn playlist_request() -> JobRequest {
        JobRequest::url(PLAYLIST_URL, OutputFormat::Mp3).with_playlist(true)
    }

    async fn run(&self, request: JobRequest, id: &str) -> Job {
        self.ctx
            .submit(request, Some(id.to_string()))
            .expect("Failed to submit job");
        self.wait_idle().await;
        self.job(id)
    }

    async fn wait_idle(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.ctx.dispatch().wait_idle())
            .await
            .expect("Dispatch queue did not go idle");
    }

    fn job(&self, id: &str) -> Job {
        self.ctx.registry().get(id).expect("Job should exist")
    }

    fn write_output(&self, name: &str) {
        std::fs::write(self.output_dir.join(name), b"existing").expect("Failed to write output");
    }
}

/// Finished counters must agree with their totals.
fn assert_counts_agree(job: &Job) {
    let counters = job.counters;
    assert_eq!(counters.dl_done, counters.dl_total, "download counters: {:?}", counters);
    assert_eq!(counters.cv_done, counters.cv_total, "convert counters: {:?}", counters);
    if let Some(playlist) = &job.playlist {
        assert_eq!(playlist.done, playlist.total, "playlist progress: {:?}", playlist);
    }
}

fn result_paths(job: &Job) -> Vec<PathBuf> {
    match &job.result_path {
        Some(ResultPath::Many(paths)) => paths.clone(),
        Some(ResultPath::Single(path)) => vec![path.clone()],
        None => Vec::new(),
    }
}

#[tokio::test]
async fn test_playlist_with_private_item() {
    let harness = TestHarness::new();
    harness.retriever.set_probe_result(fixtures::playlist(5)).await;
    harness
        .retriever
        .set_item(3, MockItem::Skip(SkipReason::Private))
        .await;

    let job = harness.run(TestHarness::playlist_request(), "pl-private").await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.skipped_count, 1);
    assert_eq!(job.errors_count, 0);
    assert_eq!(job.counters.dl_done, 5);
    assert_eq!(job.counters.cv_done, 4);
    assert_eq!(job.counters.cv_total, 4);
    assert_eq!(job.progress, 100);
    assert_eq!(result_paths(&job).len(), 4);
    assert_eq!(job.metadata.title.as_deref(), Some("Test Playlist"));
    assert_eq!(job.metadata.item_count, Some(5));
    assert_counts_agree(&job);

    assert_eq!(harness.retriever.request_count().await, 5);
    assert_eq!(harness.converter.conversion_count().await, 4);
    assert!(harness.retriever.concurrency().peak() <= 2);
    assert!(harness.converter.concurrency().peak() <= 2);
    for path in result_paths(&job) {
        assert!(path.exists(), "missing output {}", path.display());
    }
}

#[tokio::test]
async fn test_stage_concurrency_is_bounded() {
    let harness = TestHarness::with_concurrency(3, 1);
    harness.retriever.set_probe_result(fixtures::playlist(8)).await;
    harness.retriever.set_delay(Duration::from_millis(30)).await;
    harness.converter.set_delay(Duration::from_millis(20)).await;

    let job = harness.run(TestHarness::playlist_request(), "pl-bounded").await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(harness.converter.conversion_count().await, 8);
    assert!(harness.retriever.concurrency().peak() <= 3);
    assert!(harness.retriever.concurrency().peak() >= 2);
    assert_eq!(harness.converter.concurrency().peak(), 1);
}

#[tokio::test]
async fn test_existing_outputs_are_reused() {
    let harness = TestHarness::new();
    harness.retriever.set_probe_result(fixtures::playlist(3)).await;
    harness.write_output("pl-reuse_1.mp3");
    harness.write_output("pl-reuse_2.mp3");

    let job = harness.run(TestHarness::playlist_request(), "pl-reuse").await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.cv_done, 3);
    assert_eq!(result_paths(&job).len(), 3);
    assert_eq!(harness.retriever.request_count().await, 1);

    let conversions = harness.converter.recorded_conversions().await;
    assert_eq!(conversions.len(), 1);
    assert_eq!(conversions[0].job.item_id, "pl-reuse_3");
}

#[tokio::test]
async fn test_resubmitting_finished_job_resumes() {
    let harness = TestHarness::new();
    harness.retriever.set_probe_result(fixtures::playlist(3)).await;
    harness
        .retriever
        .set_item(2, MockItem::Fail("HTTP Error 503".to_string()))
        .await;

    let first = harness.run(TestHarness::playlist_request(), "pl-resume").await;
    assert_eq!(first.status, JobStatus::Completed);
    assert_eq!(first.errors_count, 1);
    assert_eq!(first.counters.cv_total, 2);
    assert_counts_agree(&first);
    assert_eq!(result_paths(&first).len(), 2);

    harness.retriever.set_item(2, MockItem::Succeed).await;
    let second = harness.run(TestHarness::playlist_request(), "pl-resume").await;

    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.errors_count, 0);
    assert_counts_agree(&second);
    assert_eq!(result_paths(&second).len(), 3);
    assert_eq!(harness.converter.conversion_count().await, 3);
}

#[tokio::test]
async fn test_all_items_failing_is_an_error() {
    let harness = TestHarness::new();
    harness.retriever.set_probe_result(fixtures::playlist(2)).await;
    for index in 1..=2 {
        harness
            .retriever
            .set_item(index, MockItem::Fail("boom".to_string()))
            .await;
    }

    let job = harness.run(TestHarness::playlist_request(), "pl-empty").await;

    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(
        job.error.as_deref(),
        Some("No items could be processed (0 skipped, 2 failed)")
    );
    assert!(job.result_path.is_none());
    assert_eq!(harness.converter.conversion_count().await, 0);
}

#[tokio::test]
async fn test_whole_playlist_invocation_without_probe() {
    let harness = TestHarness::new();
    harness.retriever.set_playlist_size(4).await;
    harness
        .retriever
        .set_item(2, MockItem::Skip(SkipReason::Removed))
        .await;

    let job = harness.run(TestHarness::playlist_request(), "pl-opaque").await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.skipped_count, 1);
    assert_eq!(job.errors_count, 0);
    assert_eq!(job.counters.cv_done, 3);
    assert_eq!(job.counters.dl_done, 4);
    assert_eq!(job.playlist.as_ref().map(|p| p.total), Some(4));
    assert_counts_agree(&job);
    assert_eq!(result_paths(&job).len(), 3);

    let requests = harness.retriever.recorded_requests().await;
    assert_eq!(requests.len(), 1);
    assert!(requests[0].is_batch);
    assert!(requests[0].item_id.is_none());

    let mut converted: Vec<String> = harness
        .converter
        .recorded_conversions()
        .await
        .into_iter()
        .map(|c| c.job.item_id)
        .collect();
    converted.sort();
    assert_eq!(converted, vec!["pl-opaque_1", "pl-opaque_3", "pl-opaque_4"]);
}

#[tokio::test]
async fn test_whole_playlist_failed_item_is_counted() {
    let harness = TestHarness::new();
    harness
        .retriever
        .set_probe_result(fixtures::opaque_playlist(4))
        .await;
    harness.retriever.set_playlist_size(4).await;
    harness
        .retriever
        .set_item(3, MockItem::Fail("HTTP Error 403".to_string()))
        .await;

    let job = harness.run(TestHarness::playlist_request(), "pl-opaque-fail").await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.errors_count, 1);
    assert_eq!(job.skipped_count, 0);
    assert_eq!(job.counters.dl_total, 4);
    assert_eq!(job.counters.dl_done, 4);
    assert_eq!(job.counters.cv_total, 3);
    assert_eq!(job.counters.cv_done, 3);
    assert_counts_agree(&job);
    assert_eq!(result_paths(&job).len(), 3);
    assert_eq!(harness.retriever.request_count().await, 1);
}

#[tokio::test]
async fn test_listed_entries_define_total() {
    let harness = TestHarness::new();
    // The provider counts an entry it does not list.
    let info = SourceInfo {
        entry_count: Some(3),
        ..fixtures::playlist(2)
    };
    harness.retriever.set_probe_result(info).await;

    let job = harness.run(TestHarness::playlist_request(), "pl-listed").await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.metadata.item_count, Some(2));
    assert_eq!(job.counters.dl_total, 2);
    assert_eq!(job.counters.cv_done, 2);
    assert_counts_agree(&job);
    assert_eq!(harness.retriever.request_count().await, 2);
}

#[tokio::test]
async fn test_skip_line_with_file_is_not_counted() {
    let harness = TestHarness::new();
    harness.retriever.set_probe_result(fixtures::playlist(3)).await;
    harness
        .retriever
        .set_item(2, MockItem::SucceedAfterSkipLine(SkipReason::Unavailable))
        .await;

    let job = harness.run(TestHarness::playlist_request(), "pl-fallback").await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.skipped_count, 0);
    assert_eq!(job.counters.cv_done, 3);
    assert_counts_agree(&job);
    assert_eq!(result_paths(&job).len(), 3);
}

#[tokio::test]
async fn test_selection_limits_items() {
    let harness = TestHarness::new();
    harness.retriever.set_probe_result(fixtures::playlist(6)).await;

    let request = TestHarness::playlist_request().with_selection(vec![5, 2, 2]);
    let job = harness.run(request, "pl-select").await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.dl_total, 2);
    assert_eq!(result_paths(&job).len(), 2);

    let mut converted: Vec<String> = harness
        .converter
        .recorded_conversions()
        .await
        .into_iter()
        .map(|c| c.job.item_id)
        .collect();
    converted.sort();
    assert_eq!(converted, vec!["pl-select_2", "pl-select_5"]);
}

#[tokio::test]
async fn test_progress_updates_stay_in_bounds() {
    let harness = TestHarness::new();
    harness.retriever.set_probe_result(fixtures::playlist(5)).await;
    harness
        .retriever
        .set_item(4, MockItem::Skip(SkipReason::Private))
        .await;
    let mut updates = harness.ctx.registry().subscribe();

    let job = harness.run(TestHarness::playlist_request(), "pl-bounds").await;
    assert_eq!(job.status, JobStatus::Completed);

    let mut last_progress = 0;
    let mut seen = 0;
    loop {
        match updates.try_recv() {
            Ok(JobUpdate::Changed { job }) => {
                seen += 1;
                assert!(job.progress <= 100);
                assert!(job.download_progress <= 100);
                assert!(job.convert_progress <= 100);
                assert!(job.counters.dl_done <= job.counters.dl_total);
                assert!(job.counters.cv_done <= job.counters.cv_total);
                assert!(job.progress >= last_progress, "progress went backwards");
                last_progress = job.progress;
            }
            Ok(JobUpdate::Removed { .. }) => {}
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    assert!(seen > 0);
    assert_eq!(last_progress, 100);
}

#[tokio::test]
async fn test_cancel_terminates_running_processes() {
    let harness = TestHarness::with_concurrency(3, 1);
    harness.retriever.set_probe_result(fixtures::playlist(3)).await;
    harness.retriever.set_delay(Duration::from_secs(30)).await;
    let mut updates = harness.ctx.registry().subscribe();

    harness
        .ctx
        .submit(TestHarness::playlist_request(), Some("pl-cancel".to_string()))
        .expect("Failed to submit job");

    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.ctx.registry().process_count("pl-cancel") < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Processes were never registered");

    let outcome = harness.ctx.cancel_job("pl-cancel").expect("Cancel failed");
    assert_eq!(outcome.processes_signaled, 3);
    assert_eq!(outcome.job.status, JobStatus::Canceled);

    harness.wait_idle().await;

    let job = harness.job("pl-cancel");
    assert_eq!(job.status, JobStatus::Canceled);
    assert!(job.canceled);
    assert!(job.result_path.is_none());
    assert_eq!(harness.ctx.registry().process_count("pl-cancel"), 0);
    assert_eq!(harness.converter.conversion_count().await, 0);

    while let Ok(update) = updates.try_recv() {
        if let JobUpdate::Changed { job } = update {
            assert_ne!(job.status, JobStatus::Completed);
        }
    }
}

#[tokio::test]
async fn test_single_url_job() {
    let harness = TestHarness::new();

    let request = JobRequest::url("https://media.example/watch?v=vid001", OutputFormat::Opus);
    let job = harness.run(request, "single-1").await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.counters.dl_done, 1);
    assert_eq!(job.counters.cv_done, 1);
    assert_eq!(job.progress, 100);
    assert!(job.playlist.is_none());

    let expected = harness.output_dir.join("single-1_1.opus");
    assert_eq!(result_paths(&job), vec![expected.clone()]);
    assert!(expected.exists());

    let requests = harness.retriever.recorded_requests().await;
    assert_eq!(requests.len(), 1);
    assert!(requests[0].audio_only);
    assert!(!requests[0].is_batch);
}

#[tokio::test]
async fn test_single_unavailable_video_fails() {
    let harness = TestHarness::new();
    harness
        .retriever
        .set_item(1, MockItem::Skip(SkipReason::Unavailable))
        .await;

    let request = JobRequest::url("https://media.example/watch?v=gone", OutputFormat::Mp3);
    let job = harness.run(request, "single-gone").await;

    assert_eq!(job.status, JobStatus::Error);
    assert!(job.error.is_some());
    assert_eq!(job.skipped_count, 1);
    assert_eq!(harness.converter.conversion_count().await, 0);
}

#[tokio::test]
async fn test_local_source_skips_download() {
    let harness = TestHarness::new();
    let input = harness.output_dir.parent().expect("parent").join("clip.wav");
    std::fs::write(&input, b"RIFF").expect("Failed to write input");

    let job = harness
        .run(JobRequest::local(&input, OutputFormat::Flac), "local-1")
        .await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.download_progress, 100);
    assert_eq!(harness.retriever.request_count().await, 0);
    assert_eq!(harness.converter.conversion_count().await, 1);
    assert!(input.exists(), "local input must be left in place");
}

#[tokio::test]
async fn test_active_job_id_is_rejected() {
    let harness = TestHarness::new();
    harness.retriever.set_delay(Duration::from_millis(200)).await;

    let request = JobRequest::url("https://media.example/watch?v=vid001", OutputFormat::Mp3);
    harness
        .ctx
        .submit(request.clone(), Some("dup".to_string()))
        .expect("Failed to submit job");
    assert!(harness.ctx.submit(request, Some("dup".to_string())).is_err());

    harness.wait_idle().await;
    assert_eq!(harness.job("dup").status, JobStatus::Completed);
}

#[tokio::test]
async fn test_single_skip_line_with_file_completes() {
    let harness = TestHarness::new();
    harness
        .retriever
        .set_item(1, MockItem::SucceedAfterSkipLine(SkipReason::Unavailable))
        .await;

    let request = JobRequest::url("https://media.example/watch?v=vid001", OutputFormat::Mp3);
    let job = harness.run(request, "single-fallback").await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.skipped_count, 0);
    assert_counts_agree(&job);
}

#[tokio::test]
async fn test_missing_converter_is_reported() {
    let harness = TestHarness::new();
    assert!(harness.ctx.check_tools().await.is_ok());

    harness.converter.set_available(false).await;
    let err = harness.ctx.check_tools().await.unwrap_err();
    assert!(matches!(err, ConverterError::FfmpegNotFound { .. }));
}
