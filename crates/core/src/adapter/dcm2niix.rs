//! DICOM to NIfTI conversion with dcm2niix.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::Dcm2niixConfig;
use super::process::{list_files, probe_tool, run_tool, sha256_file, StagingDir, ToolCommand};
use super::{AdapterError, ProducedArtifact, StageAdapter, StageOutput, StageRequest};
use crate::job::{ArtifactMetadata, ArtifactType, SourceGeometry, Stage};

const TOOL: &str = "dcm2niix";

/// Preprocessing adapter: converts the study's DICOM series into a NIfTI volume.
pub struct Dcm2niixAdapter {
    config: Dcm2niixConfig,
}

impl Dcm2niixAdapter {
    pub fn new(config: Dcm2niixConfig) -> Self {
        Self { config }
    }

    fn command(&self, request: &StageRequest, output_dir: &Path) -> ToolCommand {
        let flag = |on: bool| if on { "y" } else { "n" };
        ToolCommand::new(TOOL, &self.config.path)
            .arg("-o")
            .arg(output_dir)
            .args(["-z", flag(request.options.compression)])
            .args(["-ba", flag(request.options.anonymize)])
            .arg("-f")
            .arg(&self.config.filename_format)
            .args(["-v", "1"])
            .args(&self.config.extra_args)
            .arg(&request.dicom_dir)
    }
}

#[async_trait]
impl StageAdapter for Dcm2niixAdapter {
    fn name(&self) -> &str {
        TOOL
    }

    fn stage(&self) -> Stage {
        Stage::Preprocess
    }

    async fn execute(
        &self,
        request: StageRequest,
        cancel: CancellationToken,
    ) -> Result<StageOutput, AdapterError> {
        if !fs::metadata(&request.dicom_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(AdapterError::invalid_input(format!(
                "DICOM directory not found: {}",
                request.dicom_dir.display()
            )));
        }

        let staging = StagingDir::create(&request.job_dir).await?;
        let command = self.command(&request, staging.path());
        let output = run_tool(&command, request.deadline, &cancel).await?;

        let reported = reported_outputs(&output.stdout);
        debug!(
            "dcm2niix reported {} output(s) for job {}",
            reported.len(),
            request.job_id
        );

        let volume =
            select_primary_volume(staging.path(), &reported, self.config.min_output_bytes).await?;
        let source_geometry = read_sidecar(&staging.path().join(sidecar_name(&volume))).await;
        if source_geometry.is_none() {
            warn!(
                "No usable BIDS sidecar for {} (job {})",
                volume, request.job_id
            );
        }

        let files = list_files(staging.path()).await?;
        let output_dir = staging.publish(request.stage, request.attempt).await?;
        let path = output_dir.join(&volume);
        let checksum = sha256_file(&path).await?;

        info!(
            "Converted DICOM series for job {} into {} ({} file(s))",
            request.job_id,
            volume,
            files.len()
        );

        Ok(StageOutput::Artifact(ProducedArtifact {
            artifact_type: ArtifactType::Nifti,
            path,
            output_dir,
            checksum,
            metadata: ArtifactMetadata {
                source_geometry,
                files,
                ..Default::default()
            },
        }))
    }

    async fn validate_tool(&self) -> Result<(), AdapterError> {
        probe_tool(&ToolCommand::new(TOOL, &self.config.path).arg("-v"), &[0]).await
    }
}

fn is_nifti(name: &str) -> bool {
    name.ends_with(".nii") || name.ends_with(".nii.gz")
}

/// File names dcm2niix announced on `Saving:`/`Convert:` lines.
fn reported_outputs(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|line| line.contains("Saving:") || line.contains("Convert:"))
        .flat_map(|line| line.split_whitespace())
        .filter(|token| is_nifti(token))
        .filter_map(|token| {
            Path::new(token)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .collect()
}

/// Picks the largest NIfTI file at least `min_bytes` in size.
///
/// Reported names are preferred; the directory is scanned when none of them
/// exist (dcm2niix does not always echo the extension).
async fn select_primary_volume(
    dir: &Path,
    reported: &[String],
    min_bytes: u64,
) -> Result<String, AdapterError> {
    let mut candidates = Vec::new();
    for name in reported {
        if let Ok(meta) = fs::metadata(dir.join(name)).await {
            candidates.push((name.clone(), meta.len()));
        }
    }

    if candidates.is_empty() {
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_nifti(&name) {
                candidates.push((name, entry.metadata().await?.len()));
            }
        }
    }

    if candidates.is_empty() {
        return Err(AdapterError::missing_output(TOOL, "no NIfTI files generated"));
    }

    candidates
        .into_iter()
        .filter(|(name, size)| {
            if *size < min_bytes {
                warn!("Ignoring undersized NIfTI output {} ({} bytes)", name, size);
                false
            } else {
                true
            }
        })
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(name, _)| name)
        .ok_or_else(|| {
            AdapterError::missing_output(
                TOOL,
                format!("all NIfTI outputs are smaller than {} bytes", min_bytes),
            )
        })
}

/// `volume.nii.gz` -> `volume.json`.
fn sidecar_name(volume: &str) -> PathBuf {
    let stem = volume
        .strip_suffix(".nii.gz")
        .or_else(|| volume.strip_suffix(".nii"))
        .unwrap_or(volume);
    PathBuf::from(format!("{}.json", stem))
}

/// Source geometry from a BIDS sidecar, if present and informative.
async fn read_sidecar(path: &Path) -> Option<SourceGeometry> {
    let raw = fs::read(path).await.ok()?;
    let sidecar: serde_json::Value = serde_json::from_slice(&raw).ok()?;

    let slice_spacing_mm = sidecar
        .get("SpacingBetweenSlices")
        .or_else(|| sidecar.get("SliceThickness"))
        .and_then(|v| v.as_f64())
        .map(|v| v as f32);
    let in_plane_matrix = sidecar
        .get("ReconMatrixPE")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);

    if slice_spacing_mm.is_none() && in_plane_matrix.is_none() {
        return None;
    }
    Some(SourceGeometry {
        slice_spacing_mm,
        in_plane_matrix,
    })
}
