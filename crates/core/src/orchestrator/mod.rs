//! Job orchestrator: drives one job through its stages.
//!
//! Each [`JobOrchestrator::advance`] call performs a single step:
//! - **Start**: commit the stage's active status (compare-and-set on the job version)
//! - **Execute**: run the stage adapter under the stage timeout, polling for cancel requests
//! - **Validate**: pass produced files through the validation gate
//! - **Commit**: record the artifact and move on, or schedule a retry, requeue, or fail
//!
//! Concurrency limits and leases are the scheduler's business; the
//! orchestrator assumes the caller holds the job's lease.
//!
//! # Example
//!
//! ```rust,ignore
//! let orchestrator = JobOrchestrator::new(store, adapters, gate, retry, pipeline);
//!
//! loop {
//!     match orchestrator.advance(&job_id).await? {
//!         AdvanceOutcome::Terminal(job) => break,
//!         _ => continue,
//!     }
//! }
//! ```

mod config;
mod runner;
mod types;

pub use config::PipelineConfig;
pub use runner::{JobOrchestrator, JobUpdateCallback};
pub use types::{AdvanceOutcome, OrchestratorError};
