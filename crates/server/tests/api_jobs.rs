//! Job API tests against the in-process router.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;

use common::{fixtures, TestFixture};
use fetchcast_core::{process::SkipReason, testing::MockItem};

#[tokio::test]
async fn test_health() {
    let fixture = TestFixture::new();

    let response = fixture.get("/api/v1/health").await;

    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["status"], "ok");
}

#[tokio::test]
async fn test_config_is_served() {
    let fixture = TestFixture::new();

    let response = fixture.get("/api/v1/config").await;

    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["pipeline"]["download_concurrency"], 2);
    assert_eq!(response.body["jobs"]["gc_interval_secs"], 300);
}

#[tokio::test]
async fn test_submit_single_job_runs_to_completion() {
    let fixture = TestFixture::new();

    let response = fixture
        .post(
            "/api/v1/jobs",
            json!({
                "url": "https://media.example/watch?v=vid001",
                "format": "mp3",
                "id": "api-single"
            }),
        )
        .await;

    assert_status!(response, StatusCode::CREATED);
    assert_eq!(response.body["id"], "api-single");
    assert_eq!(response.body["status"], "queued");

    fixture.wait_idle().await;

    let response = fixture.get("/api/v1/jobs/api-single").await;
    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["status"], "completed");
    assert_eq!(response.body["progress"], 100);
    assert!(response.body["result_path"]
        .as_str()
        .is_some_and(|p| p.ends_with("api-single_1.mp3")));
}

#[tokio::test]
async fn test_submit_playlist_job() {
    let fixture = TestFixture::new();
    fixture.retriever.set_probe_result(fixtures::playlist(3)).await;
    fixture
        .retriever
        .set_item(2, MockItem::Skip(SkipReason::Private))
        .await;

    let response = fixture
        .post(
            "/api/v1/jobs",
            json!({
                "url": "https://media.example/playlist?list=PL0123",
                "format": "opus",
                "playlist": true,
                "id": "api-playlist"
            }),
        )
        .await;
    assert_status!(response, StatusCode::CREATED);

    fixture.wait_idle().await;

    let response = fixture.get("/api/v1/jobs/api-playlist").await;
    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["status"], "completed");
    assert_eq!(response.body["skipped_count"], 1);
    assert_eq!(response.body["counters"]["cv_done"], 2);
    assert_eq!(response.body["result_path"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn test_submit_requires_exactly_one_source() {
    let fixture = TestFixture::new();

    let response = fixture.post("/api/v1/jobs", json!({ "format": "mp3" })).await;
    assert_status!(response, StatusCode::BAD_REQUEST);
    assert!(response.body["error"].is_string());

    let response = fixture
        .post(
            "/api/v1/jobs",
            json!({
                "url": "https://media.example/watch?v=vid001",
                "path": "/tmp/clip.wav",
                "format": "mp3"
            }),
        )
        .await;
    assert_status!(response, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_submit_rejects_unknown_format() {
    let fixture = TestFixture::new();

    let response = fixture
        .post(
            "/api/v1/jobs",
            json!({ "url": "https://media.example/watch?v=vid001", "format": "xyz" }),
        )
        .await;

    assert!(response.status.is_client_error());
}

#[tokio::test]
async fn test_active_job_id_conflicts() {
    let fixture = TestFixture::new();
    fixture.retriever.set_delay(Duration::from_millis(200)).await;
    let body = json!({
        "url": "https://media.example/watch?v=vid001",
        "format": "mp3",
        "id": "dup"
    });

    let first = fixture.post("/api/v1/jobs", body.clone()).await;
    assert_status!(first, StatusCode::CREATED);
    let second = fixture.post("/api/v1/jobs", body).await;
    assert_status!(second, StatusCode::CONFLICT);

    fixture.wait_idle().await;
}

#[tokio::test]
async fn test_get_unknown_job() {
    let fixture = TestFixture::new();

    let response = fixture.get("/api/v1/jobs/nope").await;

    assert_status!(response, StatusCode::NOT_FOUND);
    assert_eq!(response.body["error"], "Job not found: nope");
}

#[tokio::test]
async fn test_list_jobs_with_status_filter() {
    let fixture = TestFixture::new();
    fixture.converter.fail_item("bad_1").await;

    for id in ["good", "bad"] {
        let response = fixture
            .post(
                "/api/v1/jobs",
                json!({
                    "url": "https://media.example/watch?v=vid001",
                    "format": "mp3",
                    "id": id
                }),
            )
            .await;
        assert_status!(response, StatusCode::CREATED);
    }
    fixture.wait_idle().await;

    let response = fixture.get("/api/v1/jobs").await;
    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["total"], 2);

    let response = fixture.get("/api/v1/jobs?status=error").await;
    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["total"], 1);
    assert_eq!(response.body["jobs"][0]["id"], "bad");
}

#[tokio::test]
async fn test_cancel_running_job() {
    let fixture = TestFixture::new();
    fixture.retriever.set_delay(Duration::from_secs(30)).await;

    let response = fixture
        .post(
            "/api/v1/jobs",
            json!({
                "url": "https://media.example/watch?v=vid001",
                "format": "mp3",
                "id": "slow"
            }),
        )
        .await;
    assert_status!(response, StatusCode::CREATED);

    tokio::time::timeout(Duration::from_secs(5), async {
        while fixture.context.registry().process_count("slow") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Retriever never started");

    let response = fixture.post_empty("/api/v1/jobs/slow/cancel").await;
    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["job"]["status"], "canceled");
    assert_eq!(response.body["processes_signaled"], 1);

    fixture.wait_idle().await;

    let response = fixture.get("/api/v1/jobs/slow").await;
    assert_eq!(response.body["status"], "canceled");
    assert_eq!(response.body["canceled"], true);
}

#[tokio::test]
async fn test_cancel_unknown_job() {
    let fixture = TestFixture::new();

    let response = fixture.post_empty("/api/v1/jobs/nope/cancel").await;

    assert_status!(response, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_remove_finished_job() {
    let fixture = TestFixture::new();

    fixture
        .post(
            "/api/v1/jobs",
            json!({
                "url": "https://media.example/watch?v=vid001",
                "format": "mp3",
                "id": "done"
            }),
        )
        .await;
    fixture.wait_idle().await;

    let response = fixture.delete("/api/v1/jobs/done").await;
    assert_status!(response, StatusCode::NO_CONTENT);

    let response = fixture.get("/api/v1/jobs/done").await;
    assert_status!(response, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_queue_status() {
    let fixture = TestFixture::new();

    let response = fixture.get("/api/v1/queue").await;

    assert_status!(response, StatusCode::OK);
    assert_eq!(response.body["running"], false);
    assert_eq!(response.body["pending"], json!([]));
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let fixture = TestFixture::new();
    fixture.get("/api/v1/health").await;

    let (status, body) = fixture.get_text("/api/v1/metrics").await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("fetchcast_http_requests_total"));
    assert!(body.contains("fetchcast_jobs_by_status"));
}
