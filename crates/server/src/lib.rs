//! HTTP surface of the worklist service.

pub mod api;
pub mod metrics;
pub mod state;
