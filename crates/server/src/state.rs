use std::sync::Arc;

use worklist_core::{Config, JobControl, JobStore, Scheduler};

/// Shared application state
pub struct AppState {
    config: Config,
    control: JobControl,
}

impl AppState {
    pub fn new(config: Config, control: JobControl) -> Self {
        Self { config, control }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn control(&self) -> &JobControl {
        &self.control
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        self.control.store()
    }

    /// Scheduler, absent when `scheduler.enabled` is false.
    pub fn scheduler(&self) -> Option<&Arc<Scheduler>> {
        self.control.scheduler()
    }
}
