//! Spine segmentation inference with TotalSpineSeg.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant as StdInstant;

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::TotalSpineSegConfig;
use super::process::{list_files, probe_tool, run_tool, sha256_file, StagingDir, ToolCommand};
use super::{AdapterError, ProducedArtifact, StageAdapter, StageOutput, StageRequest};
use crate::job::{ArtifactMetadata, ArtifactType, Stage};

const TOOL: &str = "totalspineseg";

/// Output directories TotalSpineSeg writes.
const OUTPUT_CATEGORIES: [&str; 4] = ["step1_output", "step2_output", "preview", "step1_levels"];

/// Directory holding the final segmentation.
const SEGMENTATION_DIR: &str = "step2_output";

const REPORT_FILE: &str = "processing_report.json";

/// Inference adapter: segments the spine in a NIfTI volume.
pub struct TotalSpineSegAdapter {
    config: TotalSpineSegConfig,
}

#[derive(Debug, Serialize)]
struct ProcessingReport<'a> {
    job_id: &'a str,
    attempt: u32,
    inference_time_seconds: f64,
    output_summary: BTreeMap<&'static str, usize>,
}

impl TotalSpineSegAdapter {
    pub fn new(config: TotalSpineSegConfig) -> Self {
        Self { config }
    }

    fn command(&self, input: &Path, output_dir: &Path) -> ToolCommand {
        let mut command = ToolCommand::new(TOOL, &self.config.path)
            .arg(input)
            .arg(output_dir)
            .args(&self.config.extra_args);
        if let Some(model_dir) = &self.config.model_dir {
            command = command.env("TOTALSPINESEG_DATA", model_dir);
        }
        command
    }

    /// Out-of-memory failures are resource waits, not tool faults.
    fn classify_failure(&self, error: AdapterError) -> AdapterError {
        let marker = match &error {
            AdapterError::ExternalTool {
                stderr: Some(stderr),
                ..
            } => self
                .config
                .oom_markers
                .iter()
                .find(|marker| stderr.contains(marker.as_str()))
                .cloned(),
            _ => None,
        };
        match marker {
            Some(marker) => {
                AdapterError::resource_exhausted(format!("accelerator out of memory ({})", marker))
            }
            None => error,
        }
    }
}

#[async_trait]
impl StageAdapter for TotalSpineSegAdapter {
    fn name(&self) -> &str {
        TOOL
    }

    fn stage(&self) -> Stage {
        Stage::Infer
    }

    async fn execute(
        &self,
        request: StageRequest,
        cancel: CancellationToken,
    ) -> Result<StageOutput, AdapterError> {
        let input = request.input_path()?;
        let name = input.to_string_lossy();
        if !(name.ends_with(".nii") || name.ends_with(".nii.gz")) {
            return Err(AdapterError::invalid_input(format!(
                "expected a .nii or .nii.gz input, got {}",
                input.display()
            )));
        }
        let size = fs::metadata(&input)
            .await
            .map_err(|e| {
                AdapterError::invalid_input(format!("input {} unreadable: {}", input.display(), e))
            })?
            .len();
        if size < self.config.small_input_bytes {
            warn!(
                "Input for job {} is unusually small: {} bytes",
                request.job_id, size
            );
        }

        let staging = StagingDir::create(&request.job_dir).await?;
        let command = self.command(&input, staging.path());

        let started = StdInstant::now();
        run_tool(&command, request.deadline, &cancel)
            .await
            .map_err(|e| self.classify_failure(e))?;
        let elapsed = started.elapsed();

        let mut summary = BTreeMap::new();
        for category in OUTPUT_CATEGORIES {
            let count = count_volumes(&staging.path().join(category)).await;
            if count == 0 {
                warn!("{}: no volumes in {}", request.job_id, category);
            }
            summary.insert(category, count);
        }

        let segmentation = first_volume(&staging.path().join(SEGMENTATION_DIR))
            .await
            .ok_or_else(|| {
                AdapterError::missing_output(TOOL, "step2_output segmentation files missing")
            })?;

        let report = ProcessingReport {
            job_id: &request.job_id,
            attempt: request.attempt,
            inference_time_seconds: elapsed.as_secs_f64(),
            output_summary: summary,
        };
        let report_json = serde_json::to_vec_pretty(&report)
            .map_err(|e| AdapterError::Io(std::io::Error::other(e)))?;
        fs::write(staging.path().join(REPORT_FILE), report_json).await?;

        let files = list_files(staging.path()).await?;
        let output_dir = staging.publish(request.stage, request.attempt).await?;
        let path = output_dir.join(SEGMENTATION_DIR).join(&segmentation);
        let checksum = sha256_file(&path).await?;

        info!(
            "Segmented job {} in {:.1}s ({})",
            request.job_id,
            elapsed.as_secs_f64(),
            segmentation
        );

        Ok(StageOutput::Artifact(ProducedArtifact {
            artifact_type: ArtifactType::Segmentation,
            path,
            output_dir,
            checksum,
            metadata: ArtifactMetadata {
                files,
                ..Default::default()
            },
        }))
    }

    async fn validate_tool(&self) -> Result<(), AdapterError> {
        probe_tool(&ToolCommand::new(TOOL, &self.config.path).arg("--help"), &[0]).await
    }
}

async fn volume_names(dir: &Path) -> Vec<String> {
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return Vec::new();
    };
    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".nii.gz") {
            names.push(name);
        }
    }
    names.sort();
    names
}

async fn count_volumes(dir: &Path) -> usize {
    volume_names(dir).await.len()
}

async fn first_volume(dir: &Path) -> Option<String> {
    volume_names(dir).await.into_iter().next()
}
