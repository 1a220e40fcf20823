//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Stage execution (attempts, durations, outcomes)
//! - Retry handling (retries, requeues, terminal jobs)
//! - Scheduler (queue depth, slot usage, leases)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts};

// =============================================================================
// Stage Metrics
// =============================================================================

/// Stage executions total by stage and outcome.
pub static STAGE_EXECUTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("worklist_stage_executions_total", "Total stage executions"),
        &["stage", "outcome"], // "advanced", "retry", "requeued", "failed", "cancelled", "interrupted"
    )
    .unwrap()
});

/// Stage execution duration in seconds.
pub static STAGE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "worklist_stage_duration_seconds",
            "Duration of stage executions",
        )
        .buckets(vec![
            1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0,
        ]),
        &["stage"],
    )
    .unwrap()
});

/// Validation gate rejections by artifact type.
pub static VALIDATION_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "worklist_validation_failures_total",
            "Total stage outputs rejected by the validation gate",
        ),
        &["artifact_type"],
    )
    .unwrap()
});

// =============================================================================
// Retry Metrics
// =============================================================================

/// Retries scheduled by stage and error kind.
pub static RETRIES_SCHEDULED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("worklist_retries_scheduled_total", "Total retries scheduled"),
        &["stage", "kind"],
    )
    .unwrap()
});

/// Requeues for lack of resources by stage.
pub static REQUEUES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "worklist_requeues_total",
            "Total jobs requeued waiting for resources",
        ),
        &["stage"],
    )
    .unwrap()
});

/// Jobs reaching a terminal status.
pub static TERMINAL_JOBS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("worklist_terminal_jobs_total", "Total jobs finished"),
        &["status"], // "complete", "failed", "cancelled"
    )
    .unwrap()
});

/// Version conflicts on job writes.
pub static VERSION_CONFLICTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "worklist_version_conflicts_total",
        "Total compare-and-set conflicts on job writes",
    )
    .unwrap()
});

/// PACS deliveries acknowledged.
pub static PACS_DELIVERIES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "worklist_pacs_deliveries_total",
        "Total DICOM-SEG objects acknowledged by PACS",
    )
    .unwrap()
});

// =============================================================================
// Scheduler Metrics
// =============================================================================

/// Execution slots in use by pool.
pub static SLOTS_IN_USE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("worklist_slots_in_use", "Execution slots currently held"),
        &["pool"], // "accelerator", "general"
    )
    .unwrap()
});

/// Slot waits that timed out by pool.
pub static SLOT_WAIT_TIMEOUTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "worklist_slot_wait_timeouts_total",
            "Total slot waits that exceeded the limit",
        ),
        &["pool"],
    )
    .unwrap()
});

/// Lease acquisitions skipped because another worker held the job.
pub static LEASES_BUSY: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "worklist_leases_busy_total",
        "Total jobs skipped because their lease was held elsewhere",
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Stages
        Box::new(STAGE_EXECUTIONS.clone()),
        Box::new(STAGE_DURATION.clone()),
        Box::new(VALIDATION_FAILURES.clone()),
        // Retries
        Box::new(RETRIES_SCHEDULED.clone()),
        Box::new(REQUEUES.clone()),
        Box::new(TERMINAL_JOBS.clone()),
        Box::new(VERSION_CONFLICTS.clone()),
        Box::new(PACS_DELIVERIES.clone()),
        // Scheduler
        Box::new(SLOTS_IN_USE.clone()),
        Box::new(SLOT_WAIT_TIMEOUTS.clone()),
        Box::new(LEASES_BUSY.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_metrics_register() {
        let registry = prometheus::Registry::new();
        for metric in all_metrics() {
            registry.register(metric).unwrap();
        }
        STAGE_EXECUTIONS
            .with_label_values(&["infer", "advanced"])
            .inc();
        assert!(!registry.gather().is_empty());
    }
}
