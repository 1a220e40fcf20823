//! Job control operations shared by every client surface.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex_lite::Regex;
use tracing::info;

use crate::job::{Artifact, Job, JobFilter, JobStatus, JobStore, NewJob};
use crate::scheduler::Scheduler;

use super::types::{ControlError, JobDetail, JobPage, SubmitRequest};

/// Longest accepted study reference.
pub const MAX_STUDY_REFERENCE_LEN: usize = 128;

/// Longest accepted annotation.
pub const MAX_ANNOTATION_LEN: usize = 4096;

static STUDY_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid regex"));

/// Checks that a study reference is usable as a directory name.
pub fn validate_study_reference(reference: &str) -> Result<(), ControlError> {
    if reference.is_empty() {
        return Err(ControlError::invalid_request("study_reference is empty"));
    }
    if reference.len() > MAX_STUDY_REFERENCE_LEN {
        return Err(ControlError::invalid_request(format!(
            "study_reference is longer than {} characters",
            MAX_STUDY_REFERENCE_LEN
        )));
    }
    if !STUDY_REFERENCE.is_match(reference) || reference.chars().all(|c| c == '.') {
        return Err(ControlError::invalid_request(format!(
            "study_reference contains invalid characters: {}",
            reference
        )));
    }
    Ok(())
}

/// Read and write access to jobs.
///
/// Writes go to the store first; the scheduler, when present, is then told
/// about the change so the job does not wait for the next poll.
pub struct JobControl {
    store: Arc<dyn JobStore>,
    scheduler: Option<Arc<Scheduler>>,
}

impl JobControl {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn scheduler(&self) -> Option<&Arc<Scheduler>> {
        self.scheduler.as_ref()
    }

    /// Create a job in `received` and queue it.
    pub fn submit(&self, request: SubmitRequest) -> Result<Job, ControlError> {
        validate_study_reference(&request.study_reference)?;

        let job = self
            .store
            .create(NewJob::new(request.study_reference, request.options))?;
        info!(
            study = %job.log_reference(),
            priority = job.options.priority,
            "Job {} received",
            job.id
        );

        self.admit(&job);
        Ok(job)
    }

    /// A job with its audit log and artifacts.
    pub fn get(&self, job_id: &str) -> Result<JobDetail, ControlError> {
        let job = self.load(job_id)?;
        let artifacts = self.store.artifacts(job_id)?;
        Ok(JobDetail { job, artifacts })
    }

    pub fn list(&self, filter: &JobFilter) -> Result<JobPage, ControlError> {
        let jobs = self.store.list(filter)?;
        let total = self.store.count(filter)?;
        Ok(JobPage {
            jobs,
            total,
            limit: filter.limit,
            offset: filter.offset,
        })
    }

    pub fn count(&self, filter: &JobFilter) -> Result<i64, ControlError> {
        Ok(self.store.count(filter)?)
    }

    /// Request cancellation. The job stops at its next check point.
    pub fn cancel(&self, job_id: &str) -> Result<Job, ControlError> {
        let job = self.store.request_cancel(job_id)?;
        info!(
            study = %job.log_reference(),
            "Cancel requested for job {} in {}",
            job.id,
            job.status
        );

        if let Some(scheduler) = &self.scheduler {
            scheduler.notify_cancel(&job);
        }
        Ok(job)
    }

    /// Create a fresh job for the study of a failed job. The failed job is left untouched.
    pub fn resubmit(&self, job_id: &str) -> Result<Job, ControlError> {
        let original = self.load(job_id)?;
        if original.status != JobStatus::Failed {
            return Err(ControlError::InvalidState {
                job_id: original.id,
                status: original.status,
                operation: "resubmit".to_string(),
            });
        }

        let job = self.store.create(
            NewJob::new(original.study_reference.clone(), original.options.clone())
                .resubmission_of(&original.id),
        )?;
        info!("Job {} resubmitted as {}", original.id, job.id);

        self.admit(&job);
        Ok(job)
    }

    /// Append an administrative note to the audit log. Allowed in any status.
    pub fn annotate(&self, job_id: &str, note: &str) -> Result<Job, ControlError> {
        let note = note.trim();
        if note.is_empty() {
            return Err(ControlError::invalid_request("annotation is empty"));
        }
        if note.len() > MAX_ANNOTATION_LEN {
            return Err(ControlError::invalid_request(format!(
                "annotation is longer than {} bytes",
                MAX_ANNOTATION_LEN
            )));
        }
        Ok(self.store.annotate(job_id, note)?)
    }

    pub fn artifacts(&self, job_id: &str) -> Result<Vec<Artifact>, ControlError> {
        self.load(job_id)?;
        Ok(self.store.artifacts(job_id)?)
    }

    fn load(&self, job_id: &str) -> Result<Job, ControlError> {
        self.store
            .get(job_id)?
            .ok_or_else(|| ControlError::NotFound(job_id.to_string()))
    }

    fn admit(&self, job: &Job) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.admit(job);
        }
    }
}
