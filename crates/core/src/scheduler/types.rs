//! Types for the scheduler.

use serde::Serialize;

use super::pool::PoolStatus;
use super::queue::QueueStatus;

/// Current status of the scheduler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    /// Whether the workers are running.
    pub running: bool,
    /// Number of worker tasks.
    pub workers: usize,
    /// Jobs waiting in the queue.
    pub queue: QueueStatus,
    /// Jobs a worker is currently stepping.
    pub executing: usize,
    /// Stages running an external tool right now.
    pub in_flight_stages: usize,
    pub pools: Vec<PoolStatus>,
    /// Steps run since startup.
    pub steps_run: u64,
    /// Jobs skipped because another worker held their lease.
    pub leases_busy: u64,
}
