//! Mock stage adapter for testing.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::fixtures::{write_nifti, write_seg, NiftiSpec};
use crate::adapter::{
    sha256_file, AdapterError, ProducedArtifact, StageAdapter, StageOutput, StageRequest,
    StagingDir,
};
use crate::job::{
    ArtifactMetadata, ArtifactType, DeliveryReceipt, SourceGeometry, Stage, VoxelGrid,
};

/// Grid of the volumes produced by a mock preprocess stage.
pub const MOCK_VOLUME_GRID: VoxelGrid = VoxelGrid {
    dims: [8, 8, 4],
    spacing: [1.0, 1.0, 3.0],
};

const DEFAULT_LABEL_COUNT: u32 = 12;

/// Destination reported by a mock store stage.
pub const MOCK_PACS_DESTINATION: &str = "MOCKPACS@localhost:11112";

/// A failure the mock can be told to produce.
#[derive(Debug, Clone, PartialEq)]
pub enum MockFailure {
    Timeout,
    ExitCode(i32),
    ResourceExhausted,
    MissingOutput,
    NotAcknowledged,
    PacsRejected(String),
}

impl MockFailure {
    fn to_error(&self, tool: &str) -> AdapterError {
        match self {
            MockFailure::Timeout => AdapterError::Timeout {
                tool: tool.to_string(),
                timeout_ms: 0,
            },
            MockFailure::ExitCode(code) => AdapterError::ExternalTool {
                tool: tool.to_string(),
                exit_code: Some(*code),
                stderr: Some(format!("mock exit {}", code)),
            },
            MockFailure::ResourceExhausted => {
                AdapterError::resource_exhausted("CUDA out of memory (mock)")
            }
            MockFailure::MissingOutput => AdapterError::missing_output(tool, "no output (mock)"),
            MockFailure::NotAcknowledged => AdapterError::not_acknowledged("no response (mock)"),
            MockFailure::PacsRejected(status) => AdapterError::PacsRejected {
                status: status.clone(),
            },
        }
    }
}

/// What the mock does on one call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockStep {
    /// Produce an output that passes validation.
    Succeed,
    Fail(MockFailure),
    /// Produce an output the validation gate rejects.
    Invalid,
    /// Run until cancelled.
    Hang,
}

/// A recorded call for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub job_id: String,
    pub attempt: u32,
    pub input_artifact_id: Option<String>,
}

/// Mock implementation of the StageAdapter trait.
///
/// Steps queued with [`MockAdapter::push_steps`] are consumed one per call;
/// once the queue is empty every call succeeds. Successful calls write
/// realistic files (NIfTI volumes, a labelled segmentation, a DICOM-SEG)
/// so the real validation gate runs against them.
#[derive(Debug)]
pub struct MockAdapter {
    name: String,
    stage: Stage,
    supports_abort: bool,
    label_count: u32,
    steps: Arc<RwLock<VecDeque<MockStep>>>,
    calls: Arc<RwLock<Vec<RecordedCall>>>,
    /// Simulated execution time in milliseconds.
    delay_ms: Arc<AtomicU64>,
    running: Arc<AtomicUsize>,
    peak_running: Arc<AtomicUsize>,
}

impl MockAdapter {
    /// Create a new mock for `stage`.
    pub fn new(stage: Stage) -> Self {
        Self {
            name: format!("mock-{}", stage),
            stage,
            supports_abort: true,
            label_count: DEFAULT_LABEL_COUNT,
            steps: Arc::new(RwLock::new(VecDeque::new())),
            calls: Arc::new(RwLock::new(Vec::new())),
            delay_ms: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            peak_running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// One mock per stage, in stage order.
    pub fn for_all_stages() -> [Arc<MockAdapter>; 4] {
        Stage::ALL.map(|stage| Arc::new(MockAdapter::new(stage)))
    }

    /// Ignores the abort signal, like a PACS send.
    pub fn without_abort(mut self) -> Self {
        self.supports_abort = false;
        self
    }

    /// Number of labels in produced segmentations.
    pub fn with_label_count(mut self, count: u32) -> Self {
        self.label_count = count;
        self
    }

    pub async fn push_steps(&self, steps: impl IntoIterator<Item = MockStep>) {
        self.steps.write().await.extend(steps);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Get all recorded calls.
    pub async fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.calls.read().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.read().await.len()
    }

    /// Highest number of calls that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    async fn produce(
        &self,
        request: &StageRequest,
        valid: bool,
    ) -> Result<StageOutput, AdapterError> {
        if self.stage == Stage::Store && valid {
            let input = request
                .input
                .as_ref()
                .ok_or_else(|| AdapterError::invalid_input("store stage requires a SEG"))?;
            return Ok(StageOutput::Delivered(DeliveryReceipt {
                artifact_id: input.id.clone(),
                destination: MOCK_PACS_DESTINATION.to_string(),
                acknowledged_at: Utc::now(),
                response: "Success".to_string(),
            }));
        }

        let staging = StagingDir::create(&request.job_dir).await?;
        let mut metadata = ArtifactMetadata::default();

        let (artifact_type, file_name) = match self.stage {
            Stage::Preprocess => {
                let spec = NiftiSpec::new(MOCK_VOLUME_GRID.dims, MOCK_VOLUME_GRID.spacing);
                write_nifti(&staging.path().join("volume.nii"), &spec)?;
                let slice_spacing = if valid { 3.0 } else { 5.0 };
                metadata.source_geometry = Some(SourceGeometry {
                    slice_spacing_mm: Some(slice_spacing),
                    in_plane_matrix: Some(8),
                });
                (ArtifactType::Nifti, "volume.nii")
            }
            Stage::Infer => {
                let grid = request
                    .input
                    .as_ref()
                    .and_then(|input| input.metadata.grid)
                    .unwrap_or(MOCK_VOLUME_GRID);
                let top = if valid { self.label_count as i64 } else { 1 };
                let labels: Vec<i64> = (0..=top).collect();
                let spec = NiftiSpec::new(grid.dims, grid.spacing).with_labels(&labels);
                write_nifti(&staging.path().join("segmentation.nii"), &spec)?;
                (ArtifactType::Segmentation, "segmentation.nii")
            }
            Stage::Postprocess | Stage::Store => {
                let labels = request
                    .input
                    .as_ref()
                    .and_then(|input| input.metadata.label_count)
                    .unwrap_or(0);
                let segments = if valid { labels } else { labels + 1 };
                write_seg(&staging.path().join("seg.dcm"), segments)?;
                (ArtifactType::Seg, "seg.dcm")
            }
        };

        let output_dir = staging.publish(self.stage, request.attempt).await?;
        let path = output_dir.join(file_name);
        metadata.files = vec![file_name.to_string()];

        Ok(StageOutput::Artifact(ProducedArtifact {
            artifact_type,
            checksum: sha256_file(&path).await?,
            path,
            output_dir,
            metadata,
        }))
    }
}

struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StageAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn stage(&self) -> Stage {
        self.stage
    }

    fn supports_abort(&self) -> bool {
        self.supports_abort
    }

    async fn execute(
        &self,
        request: StageRequest,
        cancel: CancellationToken,
    ) -> Result<StageOutput, AdapterError> {
        self.calls.write().await.push(RecordedCall {
            job_id: request.job_id.clone(),
            attempt: request.attempt,
            input_artifact_id: request.input.as_ref().map(|input| input.id.clone()),
        });

        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now_running, Ordering::SeqCst);
        let _guard = RunningGuard(Arc::clone(&self.running));

        let step = self
            .steps
            .write()
            .await
            .pop_front()
            .unwrap_or(MockStep::Succeed);

        let delay = Duration::from_millis(self.delay_ms.load(Ordering::SeqCst));
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match step {
            MockStep::Succeed => self.produce(&request, true).await,
            MockStep::Invalid => self.produce(&request, false).await,
            MockStep::Fail(failure) => Err(failure.to_error(&self.name)),
            MockStep::Hang => {
                cancel.cancelled().await;
                Err(AdapterError::Cancelled)
            }
        }
    }

    async fn validate_tool(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}
