//! Retry and timeout management.
//!
//! Classifies stage failures into [`ErrorKind`](crate::job::ErrorKind)s and
//! decides whether a job retries with backoff, goes back to the queue, or
//! fails.

mod config;
mod manager;

pub use config::{RetryConfig, StagePolicy};
pub use manager::{RetryDecision, RetryManager, StageFailure};
