//! Handlers for the `/jobs` resource.
//!
//! Thin adapters over [`Orchestrator`](murmur_engine::Orchestrator): parse
//! the request, call one engine operation, wrap the answer in the standard
//! envelope.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use murmur_core::error::CoreError;
use murmur_core::job::{JobParams, JobSnapshot, JobStatus};
use murmur_core::types::JobId;
use murmur_engine::Upload;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// Job snapshot plus the polling interval clients should use.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    #[serde(flatten)]
    pub job: JobSnapshot,
    pub poll_interval_ms: u64,
}

/// Query parameters for `GET /jobs`.
#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    pub status: Option<String>,
}

fn with_poll_interval(state: &AppState, job: JobSnapshot) -> JobStatusResponse {
    JobStatusResponse {
        job,
        poll_interval_ms: state.orchestrator.poll_interval().as_millis() as u64,
    }
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Accepts a multipart form with a required `file` field and optional
/// `num_speakers` and `language` fields. Returns 202 with the queued job.
pub async fn submit_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut params = JobParams::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                file = Some((filename, data.to_vec()));
            }
            "num_speakers" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                params.num_speakers = parse_num_speakers(&text)?;
            }
            "language" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                let text = text.trim();
                params.language = (!text.is_empty()).then(|| text.to_string());
            }
            _ => {} // ignore unknown fields
        }
    }

    let (filename, data) =
        file.ok_or_else(|| AppError::BadRequest("Missing required 'file' field".into()))?;

    let job = state
        .orchestrator
        .submit(Upload {
            filename,
            data,
            params,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DataResponse {
            data: with_poll_interval(&state, job),
        }),
    ))
}

fn parse_num_speakers(raw: &str) -> AppResult<Option<u32>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse().map(Some).map_err(|_| {
        AppError::Core(CoreError::Validation(format!(
            "num_speakers must be a positive integer, got '{raw}'"
        )))
    })
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs
///
/// List jobs in submission order, optionally filtered by `status`.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobListQuery>,
) -> AppResult<impl IntoResponse> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()?;
    let jobs = state.orchestrator.list(status).await?;
    Ok(Json(DataResponse { data: jobs }))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let job = state.orchestrator.status(job_id).await?;
    Ok(Json(DataResponse {
        data: with_poll_interval(&state, job),
    }))
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs/{id}/result
///
/// 200 with the transcript once Completed; 409 `NOT_READY` while queued or
/// processing; 422 `JOB_FAILED` for failed and cancelled jobs.
pub async fn get_result(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let result = state.orchestrator.result(job_id).await?;
    Ok(Json(DataResponse { data: result }))
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs/{id}/cancel
///
/// Always acknowledged for known jobs. `cancelled` is `false` when the job
/// had already finished.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let outcome = state.orchestrator.cancel(job_id).await?;
    tracing::info!(job_id = %job_id, cancelled = outcome.cancelled, "Cancel requested");
    Ok(Json(DataResponse { data: outcome }))
}
