//! Failure classification and retry decisions.

use std::time::Duration;

use super::config::{RetryConfig, StagePolicy};
use crate::adapter::AdapterError;
use crate::job::{ErrorKind, Stage};
use crate::validation::ValidationError;

/// A failed stage attempt, as seen by the retry manager.
#[derive(Debug, Clone, Copy)]
pub enum StageFailure<'a> {
    Adapter(&'a AdapterError),
    Validation(&'a ValidationError),
    /// No execution slot became free in time.
    NoSlot,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the stage again after `delay`.
    Retry { delay: Duration },
    /// Put the job back in the queue; no attempt is counted.
    Requeue,
    /// Give up; the job fails.
    Fail,
}

/// Applies the configured per-stage policies.
#[derive(Debug, Clone)]
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn policy(&self, stage: Stage) -> &StagePolicy {
        self.config.policy(stage)
    }

    /// Budget for one attempt of `stage`.
    pub fn timeout(&self, stage: Stage) -> Duration {
        Duration::from_millis(self.policy(stage).timeout_ms)
    }

    /// Whether a resource requeue counts as an attempt.
    pub fn counts_resource_exhaustion(&self) -> bool {
        self.config.count_resource_exhaustion
    }

    pub fn classify(&self, failure: &StageFailure<'_>) -> ErrorKind {
        match failure {
            StageFailure::Validation(_) => ErrorKind::PermanentValidation,
            StageFailure::NoSlot => ErrorKind::ResourceExhausted,
            StageFailure::Adapter(error) => match error {
                AdapterError::Timeout { .. }
                | AdapterError::Io(_)
                | AdapterError::NotAcknowledged { .. }
                | AdapterError::Cancelled => ErrorKind::Transient,
                AdapterError::ToolNotFound { .. }
                | AdapterError::InvalidInput { .. }
                | AdapterError::MissingOutput { .. } => ErrorKind::PermanentValidation,
                AdapterError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
                AdapterError::ExternalTool { .. } => ErrorKind::ExternalTool,
                AdapterError::PacsRejected { .. } => ErrorKind::PacsRejection,
            },
        }
    }

    /// Decides the follow-up for `attempt` (1-based) of `stage` failing with `kind`.
    pub fn decide(
        &self,
        stage: Stage,
        attempt: u32,
        kind: ErrorKind,
        exit_code: Option<i32>,
    ) -> RetryDecision {
        let policy = self.policy(stage);
        match kind {
            ErrorKind::PermanentValidation => RetryDecision::Fail,
            ErrorKind::ConcurrencyConflict => RetryDecision::Requeue,
            ErrorKind::ResourceExhausted => {
                if self.config.count_resource_exhaustion && attempt >= policy.max_attempts {
                    RetryDecision::Fail
                } else {
                    RetryDecision::Requeue
                }
            }
            ErrorKind::ExternalTool
                if exit_code.is_some_and(|code| policy.permanent_exit_codes.contains(&code)) =>
            {
                RetryDecision::Fail
            }
            ErrorKind::Transient | ErrorKind::ExternalTool | ErrorKind::PacsRejection => {
                if attempt >= policy.max_attempts {
                    RetryDecision::Fail
                } else {
                    RetryDecision::Retry {
                        delay: self.backoff(stage, attempt),
                    }
                }
            }
        }
    }

    /// `base * multiplier^(attempt - 1)`, capped at `max_backoff_ms`.
    pub fn backoff(&self, stage: Stage, attempt: u32) -> Duration {
        let policy = self.policy(stage);
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let delay = policy.base_backoff_ms as f64 * policy.backoff_multiplier.powi(exponent);
        let capped = delay.min(policy.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}
