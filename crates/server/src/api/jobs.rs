//! Job API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use fetchcast_core::{
    job::EntryMetadata, CancelOutcome, Job, JobError, JobRequest, JobSource, JobStatus,
    OutputFormat,
};

use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for submitting a job
#[derive(Debug, Deserialize)]
pub struct CreateJobBody {
    /// Remote URL to fetch. Mutually exclusive with `path`.
    pub url: Option<String>,
    /// Local file to convert. Mutually exclusive with `url`.
    pub path: Option<PathBuf>,
    pub format: OutputFormat,
    pub bitrate_kbps: Option<u32>,
    /// Treat `url` as a playlist.
    #[serde(default)]
    pub playlist: bool,
    /// 1-based playlist items to process.
    pub selection: Option<Vec<u32>>,
    /// Caller-known metadata per playlist entry.
    #[serde(default)]
    pub entries: Vec<EntryMetadata>,
    /// Reuse the id of a finished job to resume it.
    pub id: Option<String>,
}

impl CreateJobBody {
    fn into_request(self) -> Result<(JobRequest, Option<String>), String> {
        let source = match (self.url, self.path) {
            (Some(url), None) if !url.trim().is_empty() => JobSource::Url {
                url: url.trim().to_string(),
            },
            (None, Some(path)) => JobSource::Local { path },
            (Some(_), Some(_)) => return Err("Specify either url or path, not both".to_string()),
            _ => return Err("A url or a path is required".to_string()),
        };
        if self.id.as_deref().is_some_and(|id| id.is_empty() || id.contains('/')) {
            return Err("Invalid job id".to_string());
        }

        let request = JobRequest {
            source,
            format: self.format,
            bitrate_kbps: self.bitrate_kbps,
            playlist: self.playlist,
            selection: self.selection,
            entries: self.entries,
        };
        Ok((request, self.id))
    }
}

/// Query parameters for listing jobs
#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    /// Filter by status
    pub status: Option<JobStatus>,
}

/// Response for listing jobs
#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<Job>,
    pub total: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct JobErrorResponse {
    pub error: String,
}

fn error_response(
    status: StatusCode,
    error: impl Into<String>,
) -> (StatusCode, Json<JobErrorResponse>) {
    (
        status,
        Json(JobErrorResponse {
            error: error.into(),
        }),
    )
}

fn job_error_response(e: JobError) -> (StatusCode, Json<JobErrorResponse>) {
    let status = match &e {
        JobError::NotFound(_) => StatusCode::NOT_FOUND,
        JobError::AlreadyActive(_) => StatusCode::CONFLICT,
    };
    error_response(status, e.to_string())
}

// ============================================================================
// Handlers
// ============================================================================

/// Submit a new job
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateJobBody>,
) -> Result<(StatusCode, Json<Job>), impl IntoResponse> {
    let (request, id) = match body.into_request() {
        Ok(parsed) => parsed,
        Err(e) => return Err(error_response(StatusCode::BAD_REQUEST, e)),
    };

    match state.context().submit(request, id) {
        Ok(job) => {
            info!("Job {} submitted", job.id);
            Ok((StatusCode::CREATED, Json(job)))
        }
        Err(e) => Err(job_error_response(e)),
    }
}

/// Get a job by ID
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, impl IntoResponse> {
    match state.registry().get(&id) {
        Some(job) => Ok(Json(job)),
        None => Err(job_error_response(JobError::NotFound(id))),
    }
}

/// List jobs, oldest first
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListJobsParams>,
) -> Json<ListJobsResponse> {
    let jobs: Vec<Job> = state
        .registry()
        .list()
        .into_iter()
        .filter(|job| params.status.is_none_or(|status| job.status == status))
        .collect();

    Json(ListJobsResponse {
        total: jobs.len(),
        jobs,
    })
}

/// Cancel a job
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CancelOutcome>, impl IntoResponse> {
    state
        .context()
        .cancel_job(&id)
        .map(Json)
        .map_err(job_error_response)
}

/// Forget a finished job
pub async fn remove_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, impl IntoResponse> {
    let Some(job) = state.registry().get(&id) else {
        return Err(job_error_response(JobError::NotFound(id)));
    };
    if !job.status.is_terminal() {
        return Err(error_response(
            StatusCode::CONFLICT,
            format!("Cannot remove job {}: current status is {}", id, job.status),
        ));
    }
    state.registry().remove(&id);
    Ok(StatusCode::NO_CONTENT)
}
