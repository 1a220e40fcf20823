//! Types for the job orchestrator.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::{Job, StoreError};

/// Errors that can occur during orchestration.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Job changed underneath the step and the step no longer applies.
    #[error("job {0} was modified concurrently")]
    Conflict(String),

    /// Job store error.
    #[error("job store error: {0}")]
    Store(#[from] StoreError),
}

/// Result of one [`advance`](super::JobOrchestrator::advance) step.
#[derive(Debug, Clone)]
pub enum AdvanceOutcome {
    /// Job is complete, failed or cancelled. Nothing more to do.
    Terminal(Job),
    /// Stage output was accepted and the job moved to its next stage.
    Advanced(Job),
    /// Attempt failed; the stage runs again at `retry_at`.
    RetryScheduled {
        job: Job,
        retry_at: DateTime<Utc>,
    },
    /// Resources were unavailable; the job waits in the queue.
    Requeued(Job),
    /// Job is in backoff until `until`.
    NotReady { until: DateTime<Utc> },
    /// Execution was stopped by shutdown; the job is back at rest.
    Interrupted(Job),
}

impl AdvanceOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AdvanceOutcome::Terminal(_))
    }

    /// Job state after the step, when the step wrote one.
    pub fn job(&self) -> Option<&Job> {
        match self {
            AdvanceOutcome::Terminal(job)
            | AdvanceOutcome::Advanced(job)
            | AdvanceOutcome::RetryScheduled { job, .. }
            | AdvanceOutcome::Requeued(job)
            | AdvanceOutcome::Interrupted(job) => Some(job),
            AdvanceOutcome::NotReady { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::JobNotFound("job-456".to_string());
        assert_eq!(err.to_string(), "job not found: job-456");

        let err = OrchestratorError::Conflict("job-1".to_string());
        assert_eq!(err.to_string(), "job job-1 was modified concurrently");
    }

    #[test]
    fn test_not_ready_has_no_job() {
        let outcome = AdvanceOutcome::NotReady { until: Utc::now() };
        assert!(outcome.job().is_none());
        assert!(!outcome.is_terminal());
    }
}
