//! Job storage trait and types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::{Artifact, Job, JobOptions, JobStatus, NewAuditEntry};

/// Error type for job store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Job or artifact not found.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Write attempted with a stale version.
    #[error("Version conflict on job {job_id}: expected {expected}, found {actual}")]
    Conflict {
        job_id: String,
        expected: u64,
        actual: u64,
    },

    /// Operation not allowed in the job's current status.
    #[error("Cannot {operation} job {job_id}: current status is {status}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        operation: String,
    },

    /// Lease is held by another owner or has been taken over.
    #[error("Lease on job {job_id} lost by {owner}")]
    LeaseLost { job_id: String, owner: String },

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// Stored JSON could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Request to create a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub study_reference: String,
    pub options: JobOptions,
    /// Set when the job is a resubmission of a failed job.
    pub resubmitted_from: Option<String>,
}

impl NewJob {
    pub fn new(study_reference: impl Into<String>, options: JobOptions) -> Self {
        Self {
            study_reference: study_reference.into(),
            options,
            resubmitted_from: None,
        }
    }

    pub fn resubmission_of(mut self, job_id: impl Into<String>) -> Self {
        self.resubmitted_from = Some(job_id.into());
        self
    }
}

/// A compare-and-set write of a job.
///
/// `job` carries the mutated fields and the version it was read at. The
/// audit entries and the optional artifact are written in the same
/// transaction, or not at all.
#[derive(Debug, Clone)]
pub struct JobTransition {
    pub job: Job,
    pub audit: Vec<NewAuditEntry>,
    pub artifact: Option<Artifact>,
}

impl JobTransition {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            audit: Vec::new(),
            artifact: None,
        }
    }

    pub fn audit(mut self, entry: NewAuditEntry) -> Self {
        self.audit.push(entry);
        self
    }

    pub fn artifact(mut self, artifact: Artifact) -> Self {
        self.artifact = Some(artifact);
        self
    }
}

/// Filter for querying jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Filter by status.
    pub status: Option<JobStatus>,
    /// Only jobs updated at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only jobs updated before this instant.
    pub until: Option<DateTime<Utc>>,
    /// Maximum number of results.
    pub limit: i64,
    /// Offset for pagination.
    pub offset: i64,
}

impl JobFilter {
    /// Create a new filter with defaults.
    pub fn new() -> Self {
        Self {
            status: None,
            since: None,
            until: None,
            limit: 100,
            offset: 0,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn with_until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Exclusive, expiring claim of a worker on a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lease {
    pub job_id: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewals: u32,
}

impl Lease {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Trait for job storage backends.
pub trait JobStore: Send + Sync {
    /// Create a new job in `received` with its first audit entry.
    fn create(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Get a job by ID, including its full audit log.
    fn get(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// List jobs matching the filter, without audit logs.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Count jobs matching the filter (limit and offset are ignored).
    fn count(&self, filter: &JobFilter) -> Result<i64, StoreError>;

    /// Apply a transition if the stored version still equals `transition.job.version`.
    ///
    /// Returns the job as stored afterwards, with its version incremented.
    fn commit(&self, transition: JobTransition) -> Result<Job, StoreError>;

    /// Set the cancel flag. Idempotent while the job is not terminal.
    fn request_cancel(&self, id: &str) -> Result<Job, StoreError>;

    /// Append an administrative note. Allowed in any status.
    fn annotate(&self, id: &str, note: &str) -> Result<Job, StoreError>;

    /// All artifacts of a job, oldest first.
    fn artifacts(&self, job_id: &str) -> Result<Vec<Artifact>, StoreError>;

    /// Get an artifact by ID.
    fn get_artifact(&self, id: &str) -> Result<Option<Artifact>, StoreError>;

    /// Non-terminal jobs in queue order (priority, then submission time).
    fn runnable(&self, limit: i64) -> Result<Vec<Job>, StoreError>;

    /// Claim a job for `owner`. Returns `None` while another owner holds an unexpired lease.
    fn acquire_lease(
        &self,
        job_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError>;

    /// Extend a held lease. Fails with `LeaseLost` if it was taken over.
    fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease, StoreError>;

    /// Release a held lease. Releasing a lease that was taken over is a no-op.
    fn release_lease(&self, lease: &Lease) -> Result<(), StoreError>;
}
