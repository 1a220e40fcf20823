//! NIfTI segmentation to DICOM-SEG conversion with dcmqi's itkimage2segimage.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{SegConverterConfig, SegTemplate};
use super::process::{list_files, probe_tool, run_tool, sha256_file, StagingDir, ToolCommand};
use super::{AdapterError, ProducedArtifact, StageAdapter, StageOutput, StageRequest};
use crate::job::{ArtifactMetadata, ArtifactType, Stage};
use crate::validation::nifti;

const TOOL: &str = "itkimage2segimage";

const OUTPUT_FILE: &str = "seg.dcm";
const METADATA_FILE: &str = "seg_metadata.json";

/// Postprocessing adapter: wraps the label map in a DICOM-SEG object that
/// references the source series.
pub struct SegConverterAdapter {
    config: SegConverterConfig,
}

impl SegConverterAdapter {
    pub fn new(config: SegConverterConfig) -> Self {
        Self { config }
    }

    fn command(&self, input: &Path, dicom_dir: &Path, output: &Path, metadata: &Path) -> ToolCommand {
        let command = ToolCommand::new(TOOL, &self.config.path)
            .arg("--inputImageList")
            .arg(input)
            .arg("--inputDICOMDirectory")
            .arg(dicom_dir)
            .arg("--outputDICOM")
            .arg(output)
            .arg("--inputMetadata")
            .arg(metadata);
        if self.config.skip_empty_slices {
            command.arg("--skip")
        } else {
            command
        }
    }
}

/// Descriptor fields copied into the SEG series.
pub fn descriptor_fields(template: &SegTemplate) -> BTreeMap<String, String> {
    [
        ("ContentCreatorName", &template.content_creator_name),
        ("ClinicalTrialSeriesID", &template.clinical_trial_series_id),
        (
            "ClinicalTrialTimePointID",
            &template.clinical_trial_time_point_id,
        ),
        ("SeriesDescription", &template.series_description),
        ("SeriesNumber", &template.series_number),
        ("InstanceNumber", &template.instance_number),
        ("BodyPartExamined", &template.body_part_examined),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.clone()))
    .collect()
}

/// dcmqi metadata document with one segment per label.
fn metadata_document(template: &SegTemplate, labels: &BTreeSet<i64>) -> Value {
    let segments: Vec<Value> = labels
        .iter()
        .map(|label| {
            json!({
                "labelID": label,
                "SegmentLabel": format!("Label {}", label),
                "SegmentDescription": format!("Spine structure {}", label),
                "SegmentAlgorithmType": "AUTOMATIC",
                "SegmentAlgorithmName": template.algorithm_name,
                "SegmentedPropertyCategoryCodeSequence": {
                    "CodeValue": "123037004",
                    "CodingSchemeDesignator": "SCT",
                    "CodeMeaning": "Anatomical Structure"
                },
                "SegmentedPropertyTypeCodeSequence": {
                    "CodeValue": "421060004",
                    "CodingSchemeDesignator": "SCT",
                    "CodeMeaning": "Spinal column"
                }
            })
        })
        .collect();

    let mut document = serde_json::Map::new();
    for (key, value) in descriptor_fields(template) {
        document.insert(key, Value::String(value));
    }
    document.insert("ContentLabel".to_string(), json!("SPINESEG"));
    document.insert("segmentAttributes".to_string(), json!([segments]));
    Value::Object(document)
}

#[async_trait]
impl StageAdapter for SegConverterAdapter {
    fn name(&self) -> &str {
        TOOL
    }

    fn stage(&self) -> Stage {
        Stage::Postprocess
    }

    async fn execute(
        &self,
        request: StageRequest,
        cancel: CancellationToken,
    ) -> Result<StageOutput, AdapterError> {
        let input = request.input_path()?;
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

        let scan_path = input.clone();
        let labels = tokio::task::spawn_blocking(move || nifti::distinct_labels(&scan_path))
            .await
            .map_err(|e| AdapterError::Io(std::io::Error::other(e)))?
            .map_err(|e| AdapterError::invalid_input(format!("unreadable segmentation: {}", e)))?;
        if labels.is_empty() {
            return Err(AdapterError::invalid_input("segmentation contains no labels"));
        }
        debug!("{} labels in segmentation for job {}", labels.len(), request.job_id);

        let staging = StagingDir::create(&request.job_dir).await?;
        let output: PathBuf = staging.path().join(OUTPUT_FILE);
        let metadata_path = staging.path().join(METADATA_FILE);

        let document = metadata_document(&self.config.template, &labels);
        let document = serde_json::to_vec_pretty(&document)
            .map_err(|e| AdapterError::Io(std::io::Error::other(e)))?;
        fs::write(&metadata_path, document).await?;

        let command = self.command(&input, &request.dicom_dir, &output, &metadata_path);
        run_tool(&command, request.deadline, &cancel).await?;

        if let Err(e) = fs::remove_file(&metadata_path).await {
            warn!("Failed to remove SEG metadata file: {}", e);
        }

        if !fs::try_exists(&output).await.unwrap_or(false) {
            return Err(AdapterError::missing_output(TOOL, "no DICOM-SEG file written"));
        }

        let files = list_files(staging.path()).await?;
        let output_dir = staging.publish(request.stage, request.attempt).await?;
        let path = output_dir.join(OUTPUT_FILE);
        let checksum = sha256_file(&path).await?;

        info!(
            "Built DICOM-SEG for job {} from {} label(s)",
            request.job_id,
            labels.len()
        );

        Ok(StageOutput::Artifact(ProducedArtifact {
            artifact_type: ArtifactType::Seg,
            path,
            output_dir,
            checksum,
            // Segment count and descriptor are read back from the file by the gate
            metadata: ArtifactMetadata {
                files,
                ..Default::default()
            },
        }))
    }

    async fn validate_tool(&self) -> Result<(), AdapterError> {
        // --help exits 1 on some dcmqi builds
        probe_tool(&ToolCommand::new(TOOL, &self.config.path).arg("--help"), &[0, 1]).await
    }
}
