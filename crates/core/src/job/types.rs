//! Job and artifact types.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One discrete unit of pipeline work, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// DICOM to NIfTI conversion.
    Preprocess,
    /// Spine segmentation inference.
    Infer,
    /// Segmentation NIfTI to DICOM-SEG conversion.
    Postprocess,
    /// Delivery of the DICOM-SEG object to PACS.
    Store,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 4] = [
        Stage::Preprocess,
        Stage::Infer,
        Stage::Postprocess,
        Stage::Store,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preprocess => "preprocess",
            Stage::Infer => "infer",
            Stage::Postprocess => "postprocess",
            Stage::Store => "store",
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Preprocess => Some(Stage::Infer),
            Stage::Infer => Some(Stage::Postprocess),
            Stage::Postprocess => Some(Stage::Store),
            Stage::Store => None,
        }
    }

    /// Status a job holds while this stage is executing.
    pub fn active_status(self) -> JobStatus {
        match self {
            Stage::Preprocess => JobStatus::Preprocessing,
            Stage::Infer => JobStatus::Inferring,
            Stage::Postprocess => JobStatus::Postprocessing,
            Stage::Store => JobStatus::Storing,
        }
    }

    /// Status a job holds while waiting to start this stage.
    pub fn waiting_status(self) -> JobStatus {
        match self {
            Stage::Preprocess => JobStatus::Received,
            Stage::Infer => JobStatus::Preprocessed,
            Stage::Postprocess => JobStatus::Inferred,
            Stage::Store => JobStatus::SegReady,
        }
    }

    /// Artifact type this stage produces. The store stage produces a receipt.
    pub fn output_type(self) -> Option<ArtifactType> {
        match self {
            Stage::Preprocess => Some(ArtifactType::Nifti),
            Stage::Infer => Some(ArtifactType::Segmentation),
            Stage::Postprocess => Some(ArtifactType::Seg),
            Stage::Store => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preprocess" => Ok(Stage::Preprocess),
            "infer" => Ok(Stage::Infer),
            "postprocess" => Ok(Stage::Postprocess),
            "store" => Ok(Stage::Store),
            other => Err(format!("unknown stage: {}", other)),
        }
    }
}

/// Lifecycle status of a job.
///
/// ```text
/// received -> preprocessing -> preprocessed -> inferring -> inferred
///          -> postprocessing -> seg_ready -> storing -> complete
/// ```
///
/// Any non-terminal status can move to `failed` or `cancelled`. A failing
/// stage may pass through `retrying` before it is entered again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Received,
    Preprocessing,
    Preprocessed,
    Inferring,
    Inferred,
    Postprocessing,
    SegReady,
    Storing,
    Complete,
    Failed,
    Cancelled,
    Retrying,
}

impl JobStatus {
    pub const ALL: [JobStatus; 12] = [
        JobStatus::Received,
        JobStatus::Preprocessing,
        JobStatus::Preprocessed,
        JobStatus::Inferring,
        JobStatus::Inferred,
        JobStatus::Postprocessing,
        JobStatus::SegReady,
        JobStatus::Storing,
        JobStatus::Complete,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Received => "received",
            JobStatus::Preprocessing => "preprocessing",
            JobStatus::Preprocessed => "preprocessed",
            JobStatus::Inferring => "inferring",
            JobStatus::Inferred => "inferred",
            JobStatus::Postprocessing => "postprocessing",
            JobStatus::SegReady => "seg_ready",
            JobStatus::Storing => "storing",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Retrying => "retrying",
        }
    }

    /// Returns true if the job can never change again (besides annotations).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Returns true if the job can be cancelled from this status.
    pub fn can_cancel(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns true if a stage adapter is executing for the job.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Preprocessing
                | JobStatus::Inferring
                | JobStatus::Postprocessing
                | JobStatus::Storing
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown status: {}", s))
    }
}

/// Attempt counters, one per stage.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageAttempts {
    #[serde(default)]
    pub preprocess: u32,
    #[serde(default)]
    pub infer: u32,
    #[serde(default)]
    pub postprocess: u32,
    #[serde(default)]
    pub store: u32,
}

impl StageAttempts {
    pub fn get(&self, stage: Stage) -> u32 {
        match stage {
            Stage::Preprocess => self.preprocess,
            Stage::Infer => self.infer,
            Stage::Postprocess => self.postprocess,
            Stage::Store => self.store,
        }
    }

    fn slot(&mut self, stage: Stage) -> &mut u32 {
        match stage {
            Stage::Preprocess => &mut self.preprocess,
            Stage::Infer => &mut self.infer,
            Stage::Postprocess => &mut self.postprocess,
            Stage::Store => &mut self.store,
        }
    }

    /// Increments the counter for `stage` and returns the new value.
    pub fn increment(&mut self, stage: Stage) -> u32 {
        let slot = self.slot(stage);
        *slot += 1;
        *slot
    }

    pub fn reset(&mut self, stage: Stage) {
        *self.slot(stage) = 0;
    }
}

/// Per-job processing options supplied at submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobOptions {
    /// Strip identifying fields during conversion.
    #[serde(default)]
    pub anonymize: bool,
    /// Write gzip-compressed NIfTI volumes.
    #[serde(default = "default_compression")]
    pub compression: bool,
    /// Queue priority (higher = more urgent).
    #[serde(default)]
    pub priority: i32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            anonymize: false,
            compression: default_compression(),
            priority: 0,
        }
    }
}

fn default_compression() -> bool {
    true
}

/// Classification of a stage failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network or I/O hiccup, timeout, missing acknowledgment.
    Transient,
    /// Output rejected by the validation gate, or unusable input.
    PermanentValidation,
    /// A resource (accelerator memory, slot) is temporarily unavailable.
    ResourceExhausted,
    /// External tool exited with a non-zero code.
    ExternalTool,
    /// Stale version on write.
    ConcurrencyConflict,
    /// PACS refused the store request.
    PacsRejection,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::PermanentValidation => "permanent_validation",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::ExternalTool => "external_tool",
            ErrorKind::ConcurrencyConflict => "concurrency_conflict",
            ErrorKind::PacsRejection => "pacs_rejection",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last failure recorded on a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub stage: Stage,
    /// Attempt number that produced this error.
    pub attempt: u32,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// What happened in an audit log entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    /// Job accepted at intake.
    Received,
    /// Adapter invocation started.
    StageStarted,
    /// Stage output accepted and the job moved on.
    StageCompleted,
    /// Output rejected by the validation gate.
    ValidationFailed,
    /// Stage failed and a retry was scheduled.
    RetryScheduled,
    /// Step put back in the queue without counting an attempt.
    Requeued,
    /// Step interrupted by worker shutdown.
    Interrupted,
    /// Job reached `failed`.
    Failed,
    /// Job reached `complete`.
    Completed,
    /// Cancel flag set through the control API.
    CancelRequested,
    /// Job reached `cancelled`.
    Cancelled,
    /// Administrative note.
    Annotation,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::Received => "received",
            AuditEvent::StageStarted => "stage_started",
            AuditEvent::StageCompleted => "stage_completed",
            AuditEvent::ValidationFailed => "validation_failed",
            AuditEvent::RetryScheduled => "retry_scheduled",
            AuditEvent::Requeued => "requeued",
            AuditEvent::Interrupted => "interrupted",
            AuditEvent::Failed => "failed",
            AuditEvent::Completed => "completed",
            AuditEvent::CancelRequested => "cancel_requested",
            AuditEvent::Cancelled => "cancelled",
            AuditEvent::Annotation => "annotation",
        }
    }
}

impl FromStr for AuditEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown audit event: {}", s))
    }
}

/// One persisted audit log entry. Entries are never modified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// Position in the job's log, starting at 1.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub stage: Stage,
    /// Job status once the entry was written.
    pub status: JobStatus,
    pub event: AuditEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// An audit entry waiting to be appended alongside a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub stage: Stage,
    pub event: AuditEvent,
    pub detail: Option<String>,
}

impl NewAuditEntry {
    pub fn new(stage: Stage, event: AuditEvent) -> Self {
        Self {
            stage,
            event,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Kind of file an artifact points at.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    /// Source DICOM series.
    Dicom,
    /// Converted NIfTI volume.
    Nifti,
    /// Label map produced by inference.
    Segmentation,
    /// DICOM-SEG object ready for archiving.
    Seg,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Dicom => "dicom",
            ArtifactType::Nifti => "nifti",
            ArtifactType::Segmentation => "segmentation",
            ArtifactType::Seg => "seg",
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dicom" => Ok(ArtifactType::Dicom),
            "nifti" => Ok(ArtifactType::Nifti),
            "segmentation" => Ok(ArtifactType::Segmentation),
            "seg" => Ok(ArtifactType::Seg),
            other => Err(format!("unknown artifact type: {}", other)),
        }
    }
}

/// Spatial voxel grid of a volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct VoxelGrid {
    /// Voxel counts along i, j, k.
    pub dims: [u32; 3],
    /// Voxel size in millimetres along i, j, k.
    pub spacing: [f32; 3],
}

impl VoxelGrid {
    pub fn voxel_count(&self) -> u64 {
        self.dims
            .iter()
            .fold(1u64, |acc, &d| acc.saturating_mul(d as u64))
    }

    /// Same dimensions and spacing within `tolerance` millimetres.
    pub fn matches(&self, other: &VoxelGrid, tolerance: f32) -> bool {
        self.dims == other.dims
            && self
                .spacing
                .iter()
                .zip(other.spacing.iter())
                .all(|(a, b)| (a - b).abs() <= tolerance)
    }
}

/// Geometry reported for the source DICOM series.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SourceGeometry {
    /// Distance between slice centres in millimetres.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_spacing_mm: Option<f32>,
    /// Reconstruction matrix size in the phase-encoding direction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_plane_matrix: Option<u32>,
}

/// Facts about an artifact, from its producer and from the validation gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArtifactMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid: Option<VoxelGrid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_geometry: Option<SourceGeometry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_count: Option<u32>,
    /// DICOM-SEG descriptor fields written by the converter.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub seg_fields: BTreeMap<String, String>,
    /// Every file the tool produced, relative to the artifact directory.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

/// An immutable stage output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub id: String,
    pub job_id: String,
    pub stage: Stage,
    pub artifact_type: ArtifactType,
    /// `file://` URI of the primary file.
    pub location: String,
    /// SHA-256 of the primary file, lowercase hex.
    pub checksum: String,
    pub produced_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: ArtifactMetadata,
}

impl Artifact {
    /// Local filesystem path behind `location`.
    pub fn path(&self) -> Option<PathBuf> {
        path_from_uri(&self.location)
    }
}

/// Builds a `file://` URI for a local path.
pub fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Parses a `file://` URI back into a path.
pub fn path_from_uri(uri: &str) -> Option<PathBuf> {
    uri.strip_prefix("file://").map(PathBuf::from)
}

/// Proof that PACS acknowledged the SEG object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryReceipt {
    /// SEG artifact that was delivered.
    pub artifact_id: String,
    /// `AE@host:port` of the receiving archive.
    pub destination: String,
    pub acknowledged_at: DateTime<Utc>,
    /// Store response as reported by the archive.
    pub response: String,
}

/// A clinical study processing request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    /// Opaque study identifier (e.g. Study Instance UID).
    pub study_reference: String,
    pub stage: Stage,
    pub status: JobStatus,
    pub attempts: StageAttempts,
    pub options: JobOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
    #[serde(default)]
    pub cancel_requested: bool,
    /// When a `retrying` job may run again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    /// Last validated artifact, consumed by the current stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_artifact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryReceipt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resubmitted_from: Option<String>,
    /// Monotonic write counter for compare-and-set updates.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Ordered audit trail. Empty on list results.
    #[serde(default)]
    pub audit_log: Vec<AuditEntry>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Study reference safe for logs.
    pub fn log_reference(&self) -> &str {
        if self.options.anonymize {
            "<redacted>"
        } else {
            &self.study_reference
        }
    }
}
