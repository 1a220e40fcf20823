//! Stage adapter trait and request/response types.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::AdapterError;
use crate::job::{Artifact, ArtifactMetadata, ArtifactType, DeliveryReceipt, JobOptions, Stage};

/// Everything an adapter needs to run one attempt of a stage.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub job_id: String,
    pub stage: Stage,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    pub study_reference: String,
    /// Directory holding the study's DICOM series.
    pub dicom_dir: PathBuf,
    /// Validated output of the previous stage. `None` for preprocessing.
    pub input: Option<Artifact>,
    pub options: JobOptions,
    pub deadline: Instant,
    /// Per-job working directory. Staged and published outputs live here.
    pub job_dir: PathBuf,
}

impl StageRequest {
    /// Local path of the input artifact.
    pub fn input_path(&self) -> Result<PathBuf, AdapterError> {
        let input = self.input.as_ref().ok_or_else(|| {
            AdapterError::invalid_input(format!("{} stage requires an input artifact", self.stage))
        })?;
        input.path().ok_or_else(|| {
            AdapterError::invalid_input(format!("unsupported artifact location: {}", input.location))
        })
    }

    /// Time left until the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// A published file produced by a stage, not yet validated or recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducedArtifact {
    pub artifact_type: ArtifactType,
    /// Primary file.
    pub path: PathBuf,
    /// Published directory containing `path` and any side files.
    pub output_dir: PathBuf,
    /// SHA-256 of `path`, lowercase hex.
    pub checksum: String,
    pub metadata: ArtifactMetadata,
}

/// Successful result of a stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    /// A new file for the validation gate.
    Artifact(ProducedArtifact),
    /// The SEG object was acknowledged by PACS.
    Delivered(DeliveryReceipt),
}

impl StageOutput {
    /// Published directory to remove when the result is discarded.
    pub fn output_dir(&self) -> Option<&Path> {
        match self {
            StageOutput::Artifact(artifact) => Some(&artifact.output_dir),
            StageOutput::Delivered(_) => None,
        }
    }
}

/// Uniform wrapper around one external tool.
///
/// Implementations must not leave partial output at a published location:
/// work happens in a staging directory that is renamed into place only on
/// success.
#[async_trait]
pub trait StageAdapter: Send + Sync {
    /// Returns the name of this adapter (usually the tool name).
    fn name(&self) -> &str;

    /// Stage this adapter executes.
    fn stage(&self) -> Stage;

    /// Whether `execute` stops promptly when `cancel` fires.
    fn supports_abort(&self) -> bool {
        true
    }

    /// Runs one attempt of the stage.
    async fn execute(
        &self,
        request: StageRequest,
        cancel: CancellationToken,
    ) -> Result<StageOutput, AdapterError>;

    /// Checks that the underlying tool can be started.
    async fn validate_tool(&self) -> Result<(), AdapterError>;
}

/// One adapter per stage.
#[derive(Clone)]
pub struct AdapterSet {
    preprocess: Arc<dyn StageAdapter>,
    infer: Arc<dyn StageAdapter>,
    postprocess: Arc<dyn StageAdapter>,
    store: Arc<dyn StageAdapter>,
}

impl AdapterSet {
    pub fn new(
        preprocess: Arc<dyn StageAdapter>,
        infer: Arc<dyn StageAdapter>,
        postprocess: Arc<dyn StageAdapter>,
        store: Arc<dyn StageAdapter>,
    ) -> Self {
        Self {
            preprocess,
            infer,
            postprocess,
            store,
        }
    }

    pub fn get(&self, stage: Stage) -> &Arc<dyn StageAdapter> {
        match stage {
            Stage::Preprocess => &self.preprocess,
            Stage::Infer => &self.infer,
            Stage::Postprocess => &self.postprocess,
            Stage::Store => &self.store,
        }
    }

    /// Probes every adapter's tool, returning the failures.
    pub async fn validate_all(&self) -> Vec<(String, AdapterError)> {
        let mut failures = Vec::new();
        for stage in Stage::ALL {
            let adapter = self.get(stage);
            if let Err(e) = adapter.validate_tool().await {
                failures.push((adapter.name().to_string(), e));
            }
        }
        failures
    }
}
