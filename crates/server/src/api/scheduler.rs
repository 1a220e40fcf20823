//! Scheduler API handlers.

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use worklist_core::SchedulerStatus;

use crate::state::AppState;

/// Scheduler status response
#[derive(Debug, Serialize)]
pub struct SchedulerStatusResponse {
    /// Whether a scheduler is configured
    pub available: bool,
    #[serde(flatten)]
    pub status: SchedulerStatus,
}

/// Get scheduler status: workers, queue and slot pools
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<SchedulerStatusResponse> {
    match state.scheduler() {
        Some(scheduler) => Json(SchedulerStatusResponse {
            available: true,
            status: scheduler.status(),
        }),
        None => Json(SchedulerStatusResponse {
            available: false,
            status: SchedulerStatus::default(),
        }),
    }
}
