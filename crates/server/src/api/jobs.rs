//! Job API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use worklist_core::{
    Artifact, AuditEntry, ControlError, JobDetail, JobFilter, JobOptions, JobPage, JobStatus,
    SubmitRequest,
};

use crate::state::AppState;

/// Maximum allowed limit for job queries
const MAX_LIMIT: i64 = 1000;

/// Default limit for job queries
const DEFAULT_LIMIT: i64 = 100;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for submitting a job
#[derive(Debug, Deserialize)]
pub struct SubmitJobBody {
    /// Study instance reference
    pub study_reference: String,
    /// Priority for queue ordering (higher = more urgent)
    pub priority: Option<i32>,
    /// Strip identifying fields during conversion
    pub anonymize: Option<bool>,
    /// Write gzip-compressed volumes
    pub compression: Option<bool>,
}

impl From<SubmitJobBody> for SubmitRequest {
    fn from(body: SubmitJobBody) -> Self {
        let defaults = JobOptions::default();
        SubmitRequest {
            study_reference: body.study_reference,
            options: JobOptions {
                anonymize: body.anonymize.unwrap_or(defaults.anonymize),
                compression: body.compression.unwrap_or(defaults.compression),
                priority: body.priority.unwrap_or(defaults.priority),
            },
        }
    }
}

/// Query parameters for listing jobs
#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    /// Filter by status
    pub status: Option<String>,
    /// Only jobs updated at or after this RFC 3339 instant
    pub since: Option<String>,
    /// Only jobs updated before this RFC 3339 instant
    pub until: Option<String>,
    /// Maximum number of jobs to return
    pub limit: Option<i64>,
    /// Pagination offset
    pub offset: Option<i64>,
}

/// Request body for annotating a job
#[derive(Debug, Deserialize)]
pub struct AnnotateJobBody {
    pub note: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct CancelJobResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub cancel_requested: bool,
}

#[derive(Debug, Serialize)]
pub struct ResubmitJobResponse {
    pub job_id: String,
    pub resubmitted_from: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct JobErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<JobErrorResponse>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(JobErrorResponse {
            error: message.into(),
        }),
    )
}

fn control_error(e: ControlError) -> ApiError {
    let status = match &e {
        ControlError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ControlError::NotFound(_) => StatusCode::NOT_FOUND,
        ControlError::InvalidState { .. } | ControlError::Conflict(_) => StatusCode::CONFLICT,
        ControlError::Store(_) => {
            error!("Job store error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(JobErrorResponse {
            error: e.to_string(),
        }),
    )
}

fn parse_instant(name: &str, value: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| bad_request(format!("invalid {}: {}", name, e)))
}

// ============================================================================
// Handlers
// ============================================================================

/// Submit a new job
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitJobBody>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let job = state
        .control()
        .submit(SubmitRequest::from(body))
        .map_err(control_error)?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitJobResponse {
            job_id: job.id,
            status: job.status,
        }),
    ))
}

/// Get a job with its audit log and artifacts
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobDetail>, ApiError> {
    state.control().get(&id).map(Json).map_err(control_error)
}

/// List jobs with optional filters
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<JobPage>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let mut filter = JobFilter::new().with_limit(limit).with_offset(offset);

    if let Some(ref status) = params.status {
        let status: JobStatus = status.parse().map_err(bad_request)?;
        filter = filter.with_status(status);
    }

    if let Some(ref since) = params.since {
        filter = filter.with_since(parse_instant("since", since)?);
    }

    if let Some(ref until) = params.until {
        filter = filter.with_until(parse_instant("until", until)?);
    }

    state.control().list(&filter).map(Json).map_err(control_error)
}

/// Request cancellation of a job
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CancelJobResponse>), ApiError> {
    let job = state.control().cancel(&id).map_err(control_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CancelJobResponse {
            job_id: job.id,
            status: job.status,
            cancel_requested: job.cancel_requested,
        }),
    ))
}

/// Resubmit a failed job as a new job
pub async fn resubmit_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<ResubmitJobResponse>), ApiError> {
    let job = state.control().resubmit(&id).map_err(control_error)?;

    Ok((
        StatusCode::CREATED,
        Json(ResubmitJobResponse {
            job_id: job.id,
            resubmitted_from: id,
        }),
    ))
}

/// Append an administrative note to a job's audit log
pub async fn annotate_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AnnotateJobBody>,
) -> Result<(StatusCode, Json<AuditEntry>), ApiError> {
    let job = state
        .control()
        .annotate(&id, &body.note)
        .map_err(control_error)?;

    match job.audit_log.into_iter().last() {
        Some(entry) => Ok((StatusCode::CREATED, Json(entry))),
        None => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(JobErrorResponse {
                error: format!("annotation of job {} was not recorded", id),
            }),
        )),
    }
}

/// List the artifacts of a job
pub async fn list_artifacts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Artifact>>, ApiError> {
    state.control().artifacts(&id).map(Json).map_err(control_error)
}
