use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::{handlers, jobs, middleware::metrics_middleware, scheduler};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // API routes
    let api_routes = Router::new()
        // Health and config
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        // Jobs
        .route("/job", post(jobs::submit_job))
        .route("/jobs", get(jobs::list_jobs))
        .route("/job/{id}", get(jobs::get_job))
        .route("/job/{id}/cancel", post(jobs::cancel_job))
        .route("/job/{id}/resubmit", post(jobs::resubmit_job))
        .route("/job/{id}/annotations", post(jobs::annotate_job))
        .route("/job/{id}/artifacts", get(jobs::list_artifacts))
        // Scheduler
        .route("/scheduler/status", get(scheduler::get_status));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::get_metrics))
        .with_state(state)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
