//! Scheduler: runs jobs on a bounded worker pool.
//!
//! The scheduler owns:
//! - a priority queue of jobs waiting for a worker, with delayed entries for
//!   backoff and requeue
//! - two slot pools: exclusive accelerator slots for inference, general slots
//!   for everything else
//! - one lease per job being stepped, renewed while the stage runs
//!
//! Jobs persist across restarts; on start every non-terminal job in the store
//! is queued again.

mod config;
mod pool;
mod queue;
mod runner;
mod types;

pub use config::SchedulerConfig;
pub use pool::{PoolKind, PoolStatus, ResourcePools, SlotGuard};
pub use queue::{JobQueue, QueueStatus, QueuedJob};
pub use runner::Scheduler;
pub use types::SchedulerStatus;
