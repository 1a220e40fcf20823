//! Retry and timeout configuration.

use serde::{Deserialize, Serialize};

use crate::job::Stage;

/// Retry behaviour for one stage.
///
/// Fields missing from a configured table take the generic defaults below,
/// not the stage-specific ones used when the whole table is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePolicy {
    /// Attempts before the job fails, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (milliseconds).
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Factor applied to the delay after each failed attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound for the delay (milliseconds).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Wall-clock budget for one attempt (milliseconds).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Tool exit codes that will not succeed on retry.
    #[serde(default)]
    pub permanent_exit_codes: Vec<i32>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    5_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_timeout_ms() -> u64 {
    600_000 // 10 minutes
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            timeout_ms: default_timeout_ms(),
            permanent_exit_codes: Vec::new(),
        }
    }
}

fn default_preprocess_policy() -> StagePolicy {
    StagePolicy::default()
}

fn default_infer_policy() -> StagePolicy {
    StagePolicy {
        max_attempts: 2,
        base_backoff_ms: 30_000,
        timeout_ms: 1_800_000, // 30 minutes
        ..Default::default()
    }
}

fn default_postprocess_policy() -> StagePolicy {
    StagePolicy::default()
}

fn default_store_policy() -> StagePolicy {
    StagePolicy {
        max_attempts: 5,
        base_backoff_ms: 10_000,
        max_backoff_ms: 600_000,
        timeout_ms: 300_000,
        ..Default::default()
    }
}

/// Per-stage retry policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Count requeues for lack of resources against `max_attempts`.
    #[serde(default)]
    pub count_resource_exhaustion: bool,

    #[serde(default = "default_preprocess_policy")]
    pub preprocess: StagePolicy,

    #[serde(default = "default_infer_policy")]
    pub infer: StagePolicy,

    #[serde(default = "default_postprocess_policy")]
    pub postprocess: StagePolicy,

    #[serde(default = "default_store_policy")]
    pub store: StagePolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            count_resource_exhaustion: false,
            preprocess: default_preprocess_policy(),
            infer: default_infer_policy(),
            postprocess: default_postprocess_policy(),
            store: default_store_policy(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self, stage: Stage) -> &StagePolicy {
        match stage {
            Stage::Preprocess => &self.preprocess,
            Stage::Infer => &self.infer,
            Stage::Postprocess => &self.postprocess,
            Stage::Store => &self.store,
        }
    }
}
