pub mod adapter;
pub mod config;
pub mod control;
pub mod job;
pub mod metrics;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod testing;
pub mod validation;

pub use adapter::{build_adapters, AdapterError, AdapterSet, StageAdapter};
pub use config::{
    config_path, load_config, load_config_from_str, validate_config, Config, ConfigError,
    DatabaseConfig, ServerConfig,
};
pub use control::{ControlError, JobControl, JobDetail, JobPage, SubmitRequest};
pub use job::{
    Artifact, ArtifactType, AuditEntry, AuditEvent, ErrorKind, Job, JobFilter, JobOptions,
    JobStatus, JobStore, SqliteJobStore, Stage, StoreError,
};
pub use orchestrator::{AdvanceOutcome, JobOrchestrator, OrchestratorError, PipelineConfig};
pub use retry::{RetryConfig, RetryManager};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStatus};
pub use validation::{ValidationConfig, ValidationGate};
