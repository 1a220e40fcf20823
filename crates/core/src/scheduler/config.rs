//! Scheduler configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the scheduler and its worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Enable/disable the worker pool.
    /// When disabled, jobs are accepted and stored but never run.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Number of workers, each running one job step at a time.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Exclusive accelerator slots gating the inference stage.
    #[serde(default = "default_accelerator_slots")]
    pub accelerator_slots: usize,

    /// Slots shared by every other stage.
    #[serde(default = "default_general_slots")]
    pub general_slots: usize,

    /// How long a worker waits for a slot before requeueing the job (milliseconds).
    #[serde(default = "default_slot_wait_ms")]
    pub slot_wait_ms: u64,

    /// Delay before a requeued job is offered again (milliseconds).
    #[serde(default = "default_requeue_delay_ms")]
    pub requeue_delay_ms: u64,

    /// Lifetime of a job lease (milliseconds). Renewed every third of it.
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// How often to scan the store for runnable jobs (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How often a running stage checks for a cancel request (milliseconds).
    #[serde(default = "default_cancel_check_interval_ms")]
    pub cancel_check_interval_ms: u64,

    /// Prefix of lease owner names. Defaults to a random id per process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_workers() -> usize {
    4
}

fn default_accelerator_slots() -> usize {
    1
}

fn default_general_slots() -> usize {
    4
}

fn default_slot_wait_ms() -> u64 {
    30_000
}

fn default_requeue_delay_ms() -> u64 {
    5_000
}

fn default_lease_ttl_ms() -> u64 {
    60_000
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_cancel_check_interval_ms() -> u64 {
    2_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            workers: default_workers(),
            accelerator_slots: default_accelerator_slots(),
            general_slots: default_general_slots(),
            slot_wait_ms: default_slot_wait_ms(),
            requeue_delay_ms: default_requeue_delay_ms(),
            lease_ttl_ms: default_lease_ttl_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            cancel_check_interval_ms: default_cancel_check_interval_ms(),
            instance_id: None,
        }
    }
}

impl SchedulerConfig {
    pub fn slot_wait(&self) -> Duration {
        Duration::from_millis(self.slot_wait_ms)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// Interval between lease renewals.
    pub fn lease_renewal(&self) -> Duration {
        Duration::from_millis((self.lease_ttl_ms / 3).max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cancel_check_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_check_interval_ms)
    }
}
