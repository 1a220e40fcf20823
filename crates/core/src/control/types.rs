//! Types for the control surface.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{Artifact, Job, JobOptions, JobStatus, StoreError};

/// Errors returned by [`JobControl`](super::JobControl) operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The request itself is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("job not found: {0}")]
    NotFound(String),

    /// The job's status does not allow the operation.
    #[error("cannot {operation} job {job_id} in status {status}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        operation: String,
    },

    #[error("job {0} was modified concurrently")]
    Conflict(String),

    #[error("job store error: {0}")]
    Store(StoreError),
}

impl ControlError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        ControlError::InvalidRequest(message.into())
    }
}

impl From<StoreError> for ControlError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ControlError::NotFound(id),
            StoreError::InvalidState {
                job_id,
                status,
                operation,
            } => ControlError::InvalidState {
                job_id,
                status,
                operation,
            },
            StoreError::Conflict { job_id, .. } => ControlError::Conflict(job_id),
            other => ControlError::Store(other),
        }
    }
}

/// A new job as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Study instance reference; names the study's DICOM directory.
    pub study_reference: String,
    #[serde(default)]
    pub options: JobOptions,
}

impl SubmitRequest {
    pub fn new(study_reference: impl Into<String>) -> Self {
        Self {
            study_reference: study_reference.into(),
            options: JobOptions::default(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.options.priority = priority;
        self
    }
}

/// A job with its audit log and artifacts.
#[derive(Debug, Clone, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    pub artifacts: Vec<Artifact>,
}

/// One page of a job listing.
#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// Matching jobs across all pages.
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}
