//! Durable job records: status machine data, artifacts, audit log and leases.

mod sqlite_store;
mod store;
mod types;

pub use sqlite_store::SqliteJobStore;
pub use store::{JobFilter, JobStore, JobTransition, Lease, NewJob, StoreError};
pub use types::{
    file_uri, path_from_uri, Artifact, ArtifactMetadata, ArtifactType, AuditEntry, AuditEvent,
    DeliveryReceipt, ErrorInfo, ErrorKind, Job, JobOptions, JobStatus, NewAuditEntry,
    SourceGeometry, Stage, StageAttempts, VoxelGrid,
};
