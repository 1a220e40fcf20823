//! Output checks between stages.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use super::config::ValidationConfig;
use super::dicom::{DicomError, SegSummary};
use super::nifti::{self, NiftiHeader};
use crate::adapter::ProducedArtifact;
use crate::job::{Artifact, ArtifactMetadata, ArtifactType, VoxelGrid};

/// Grids must agree to this many millimetres to count as identical.
pub const GRID_TOLERANCE_MM: f32 = 1e-4;

/// Reasons a stage output is rejected. All are permanent.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Unreadable output: {0}")]
    Unreadable(String),

    #[error("Volume has an empty voxel grid {0:?}")]
    EmptyGrid([u32; 3]),

    #[error("Source geometry missing for converted volume")]
    MissingSourceGeometry,

    #[error("Slice spacing {actual} mm differs from source {expected} mm")]
    SpacingMismatch { expected: f32, actual: f32 },

    #[error("In-plane matrix {actual:?} does not match source matrix {expected}")]
    MatrixMismatch { expected: u32, actual: [u32; 2] },

    #[error("Upstream artifact is missing {0}")]
    MissingUpstream(&'static str),

    #[error("Segmentation grid {actual:?} differs from input grid {expected:?}")]
    GridMismatch {
        expected: VoxelGrid,
        actual: VoxelGrid,
    },

    #[error("Segmentation has {found} labels, at least {required} required")]
    TooFewLabels { found: u32, required: u32 },

    #[error("Not a DICOM file (no DICM marker)")]
    NotDicom,

    #[error("DICOM modality is {0:?}, expected SEG")]
    NotSegmentation(String),

    #[error("SEG descriptor field {0} is empty")]
    MissingSegField(String),

    #[error("SEG has {actual} segments, segmentation has {expected} labels")]
    SegmentCountMismatch { expected: u32, actual: u32 },

    #[error("Checksum mismatch: reported {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("No validation rule for {0} artifacts")]
    UnsupportedType(ArtifactType),
}

impl From<nifti::NiftiError> for ValidationError {
    fn from(e: nifti::NiftiError) -> Self {
        Self::Unreadable(e.to_string())
    }
}

impl From<DicomError> for ValidationError {
    fn from(e: DicomError) -> Self {
        match e {
            DicomError::NotDicom => Self::NotDicom,
            other => Self::Unreadable(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ValidationError {
    fn from(e: std::io::Error) -> Self {
        Self::Unreadable(e.to_string())
    }
}

/// Facts established by the gate, merged into the stored artifact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub grid: Option<VoxelGrid>,
    pub label_count: Option<u32>,
    pub segment_count: Option<u32>,
    /// Descriptor attributes read from a DICOM-SEG.
    pub seg_fields: Option<BTreeMap<String, String>>,
}

impl ValidationReport {
    pub fn apply(&self, metadata: &mut ArtifactMetadata) {
        if self.grid.is_some() {
            metadata.grid = self.grid;
        }
        if self.label_count.is_some() {
            metadata.label_count = self.label_count;
        }
        if self.segment_count.is_some() {
            metadata.segment_count = self.segment_count;
        }
        if let Some(fields) = &self.seg_fields {
            metadata.seg_fields = fields.clone();
        }
    }
}

/// Inspects stage outputs. Blocking; run it on the blocking pool.
#[derive(Debug, Clone)]
pub struct ValidationGate {
    config: ValidationConfig,
}

impl ValidationGate {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Checks `produced` against its type's rules and the upstream artifact it
    /// was derived from.
    pub fn inspect(
        &self,
        produced: &ProducedArtifact,
        upstream: Option<&Artifact>,
    ) -> Result<ValidationReport, ValidationError> {
        let report = match produced.artifact_type {
            ArtifactType::Nifti => self.inspect_volume(produced)?,
            ArtifactType::Segmentation => self.inspect_segmentation(produced, upstream)?,
            ArtifactType::Seg => self.inspect_seg(produced, upstream)?,
            other => return Err(ValidationError::UnsupportedType(other)),
        };
        debug!(
            "{} artifact {:?} passed validation",
            produced.artifact_type, produced.path
        );
        Ok(report)
    }

    fn inspect_volume(&self, produced: &ProducedArtifact) -> Result<ValidationReport, ValidationError> {
        let grid = NiftiHeader::read(&produced.path)?.grid();
        if grid.voxel_count() == 0 {
            return Err(ValidationError::EmptyGrid(grid.dims));
        }

        match produced.metadata.source_geometry {
            Some(source) => {
                if let Some(expected) = source.slice_spacing_mm {
                    let actual = grid.spacing[2];
                    if (actual - expected).abs() > self.config.spacing_tolerance_mm {
                        return Err(ValidationError::SpacingMismatch { expected, actual });
                    }
                }
                if let Some(expected) = source.in_plane_matrix {
                    if grid.dims[0] != expected && grid.dims[1] != expected {
                        return Err(ValidationError::MatrixMismatch {
                            expected,
                            actual: [grid.dims[0], grid.dims[1]],
                        });
                    }
                }
            }
            None if self.config.require_source_geometry => {
                return Err(ValidationError::MissingSourceGeometry)
            }
            None => {}
        }

        Ok(ValidationReport {
            grid: Some(grid),
            ..Default::default()
        })
    }

    fn inspect_segmentation(
        &self,
        produced: &ProducedArtifact,
        upstream: Option<&Artifact>,
    ) -> Result<ValidationReport, ValidationError> {
        let expected = upstream
            .ok_or(ValidationError::MissingUpstream("input volume"))?
            .metadata
            .grid
            .ok_or(ValidationError::MissingUpstream("voxel grid"))?;

        let grid = NiftiHeader::read(&produced.path)?.grid();
        if !grid.matches(&expected, GRID_TOLERANCE_MM) {
            return Err(ValidationError::GridMismatch {
                expected,
                actual: grid,
            });
        }

        let found = nifti::distinct_labels(&produced.path)?.len() as u32;
        if found < self.config.min_labels {
            return Err(ValidationError::TooFewLabels {
                found,
                required: self.config.min_labels,
            });
        }

        Ok(ValidationReport {
            grid: Some(grid),
            label_count: Some(found),
            ..Default::default()
        })
    }

    /// Checks the SEG as written, ignoring what the adapter reported about it.
    fn inspect_seg(
        &self,
        produced: &ProducedArtifact,
        upstream: Option<&Artifact>,
    ) -> Result<ValidationReport, ValidationError> {
        let seg = SegSummary::read(&produced.path)?;
        let modality = seg.modality.unwrap_or_default();
        if modality != "SEG" {
            return Err(ValidationError::NotSegmentation(modality));
        }

        for field in &self.config.required_seg_fields {
            let present = seg
                .descriptor
                .get(field)
                .is_some_and(|v| !v.trim().is_empty());
            if !present {
                return Err(ValidationError::MissingSegField(field.clone()));
            }
        }

        let expected = upstream
            .ok_or(ValidationError::MissingUpstream("segmentation"))?
            .metadata
            .label_count
            .ok_or(ValidationError::MissingUpstream("label count"))?;
        if seg.segment_count != expected {
            return Err(ValidationError::SegmentCountMismatch {
                expected,
                actual: seg.segment_count,
            });
        }

        let computed = sha256_file(&produced.path)?;
        if computed != produced.checksum {
            return Err(ValidationError::ChecksumMismatch {
                expected: produced.checksum.clone(),
                actual: computed,
            });
        }

        Ok(ValidationReport {
            segment_count: Some(seg.segment_count),
            seg_fields: Some(seg.descriptor),
            ..Default::default()
        })
    }
}

fn sha256_file(path: &Path) -> Result<String, ValidationError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SourceGeometry;
    use crate::testing::fixtures::{
        nifti_artifact_with, produced, write_nifti, write_seg, write_seg_with, NiftiSpec,
    };

    fn gate() -> ValidationGate {
        ValidationGate::new(ValidationConfig {
            min_labels: 3,
            ..Default::default()
        })
    }

    fn geometry(spacing: f32) -> Option<SourceGeometry> {
        Some(SourceGeometry {
            slice_spacing_mm: Some(spacing),
            in_plane_matrix: None,
        })
    }

    #[test]
    fn test_volume_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t2.nii");
        write_nifti(&path, &NiftiSpec::new([16, 16, 8], [0.5, 0.5, 3.0])).unwrap();

        let mut artifact = produced(ArtifactType::Nifti, &path);
        artifact.metadata.source_geometry = geometry(3.0);

        let report = gate().inspect(&artifact, None).unwrap();
        assert_eq!(report.grid.unwrap().dims, [16, 16, 8]);
    }

    #[test]
    fn test_volume_spacing_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t2.nii");
        write_nifti(&path, &NiftiSpec::new([16, 16, 8], [0.5, 0.5, 3.0])).unwrap();

        let mut artifact = produced(ArtifactType::Nifti, &path);
        artifact.metadata.source_geometry = geometry(4.0);

        assert!(matches!(
            gate().inspect(&artifact, None),
            Err(ValidationError::SpacingMismatch { .. })
        ));
    }

    #[test]
    fn test_volume_requires_source_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t2.nii");
        write_nifti(&path, &NiftiSpec::new([16, 16, 8], [0.5, 0.5, 3.0])).unwrap();

        let artifact = produced(ArtifactType::Nifti, &path);
        assert_eq!(
            gate().inspect(&artifact, None),
            Err(ValidationError::MissingSourceGeometry)
        );

        let lenient = ValidationGate::new(ValidationConfig {
            require_source_geometry: false,
            ..Default::default()
        });
        assert!(lenient.inspect(&artifact, None).is_ok());
    }

    #[test]
    fn test_volume_matrix_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t2.nii");
        write_nifti(&path, &NiftiSpec::new([16, 16, 8], [0.5, 0.5, 3.0])).unwrap();

        let mut artifact = produced(ArtifactType::Nifti, &path);
        artifact.metadata.source_geometry = Some(SourceGeometry {
            slice_spacing_mm: Some(3.0),
            in_plane_matrix: Some(320),
        });
        assert!(matches!(
            gate().inspect(&artifact, None),
            Err(ValidationError::MatrixMismatch { expected: 320, .. })
        ));
    }

    #[test]
    fn test_segmentation_grid_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = nifti_artifact_with(dir.path(), "job-1", &NiftiSpec::new([8, 8, 4], [1.0, 1.0, 3.0]));

        let path = dir.path().join("seg.nii");
        let spec = NiftiSpec::new([8, 8, 5], [1.0, 1.0, 3.0]).with_labels(&[1, 2, 3, 4]);
        write_nifti(&path, &spec).unwrap();

        let artifact = produced(ArtifactType::Segmentation, &path);
        assert!(matches!(
            gate().inspect(&artifact, Some(&upstream)),
            Err(ValidationError::GridMismatch { .. })
        ));
    }

    #[test]
    fn test_segmentation_label_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let spec = NiftiSpec::new([8, 8, 4], [1.0, 1.0, 3.0]);
        let upstream = nifti_artifact_with(dir.path(), "job-1", &spec);

        let few = dir.path().join("few.nii");
        write_nifti(&few, &spec.clone().with_labels(&[0, 1, 2])).unwrap();
        assert_eq!(
            gate().inspect(&produced(ArtifactType::Segmentation, &few), Some(&upstream)),
            Err(ValidationError::TooFewLabels {
                found: 2,
                required: 3
            })
        );

        let enough = dir.path().join("enough.nii");
        write_nifti(&enough, &spec.with_labels(&[0, 1, 2, 3, 3])).unwrap();
        let report = gate()
            .inspect(&produced(ArtifactType::Segmentation, &enough), Some(&upstream))
            .unwrap();
        assert_eq!(report.label_count, Some(3));
    }

    #[test]
    fn test_segmentation_needs_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.nii");
        write_nifti(&path, &NiftiSpec::new([8, 8, 4], [1.0, 1.0, 3.0])).unwrap();
        assert!(matches!(
            gate().inspect(&produced(ArtifactType::Segmentation, &path), None),
            Err(ValidationError::MissingUpstream(_))
        ));
    }

    fn segmentation_upstream(dir: &Path, labels: u32) -> Artifact {
        let mut upstream =
            nifti_artifact_with(dir, "job-1", &NiftiSpec::new([4, 4, 4], [1.0; 3]));
        upstream.artifact_type = ArtifactType::Segmentation;
        upstream.metadata.label_count = Some(labels);
        upstream
    }

    #[test]
    fn test_seg_checks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.dcm");
        write_seg(&path, 5).unwrap();
        let upstream = segmentation_upstream(dir.path(), 5);

        let artifact = produced(ArtifactType::Seg, &path);
        let report = gate().inspect(&artifact, Some(&upstream)).unwrap();
        assert_eq!(report.segment_count, Some(5));
        let fields = report.seg_fields.unwrap();
        assert_eq!(
            fields.get("SeriesDescription").map(String::as_str),
            Some("AI Spine Segmentation")
        );

        let mut tampered = artifact;
        tampered.checksum = "0".repeat(64);
        assert!(matches!(
            gate().inspect(&tampered, Some(&upstream)),
            Err(ValidationError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_seg_segment_count_read_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.dcm");
        write_seg(&path, 4).unwrap();
        let upstream = segmentation_upstream(dir.path(), 5);

        // What the adapter claims about the file does not count
        let mut artifact = produced(ArtifactType::Seg, &path);
        artifact.metadata.segment_count = Some(5);
        artifact.metadata.seg_fields =
            crate::adapter::descriptor_fields(&crate::adapter::SegTemplate::default());

        assert_eq!(
            gate().inspect(&artifact, Some(&upstream)),
            Err(ValidationError::SegmentCountMismatch {
                expected: 5,
                actual: 4
            })
        );
    }

    #[test]
    fn test_seg_descriptor_read_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = segmentation_upstream(dir.path(), 3);
        let mut fields =
            crate::adapter::descriptor_fields(&crate::adapter::SegTemplate::default());

        let blank = dir.path().join("blank.dcm");
        fields.insert("SeriesDescription".to_string(), " ".to_string());
        write_seg_with(&blank, &fields, 3).unwrap();
        assert_eq!(
            gate().inspect(&produced(ArtifactType::Seg, &blank), Some(&upstream)),
            Err(ValidationError::MissingSegField("SeriesDescription".to_string()))
        );

        let missing = dir.path().join("missing.dcm");
        fields.insert("SeriesDescription".to_string(), "Spine".to_string());
        fields.remove("BodyPartExamined");
        write_seg_with(&missing, &fields, 3).unwrap();
        let mut artifact = produced(ArtifactType::Seg, &missing);
        artifact
            .metadata
            .seg_fields
            .insert("BodyPartExamined".to_string(), "SPINE".to_string());
        assert_eq!(
            gate().inspect(&artifact, Some(&upstream)),
            Err(ValidationError::MissingSegField("BodyPartExamined".to_string()))
        );
    }

    #[test]
    fn test_seg_without_file_meta() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.dcm");
        let mut bytes = vec![0u8; 128];
        bytes.extend_from_slice(b"DICM");
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            gate().inspect(&produced(ArtifactType::Seg, &path), None),
            Err(ValidationError::Unreadable(_))
        ));
    }

    #[test]
    fn test_volume_with_oversized_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostile.nii");
        let mut raw = [0u8; nifti::HEADER_SIZE];
        raw[0..4].copy_from_slice(&348i32.to_le_bytes());
        raw[40..42].copy_from_slice(&7i16.to_le_bytes());
        for axis in 1..=7 {
            let offset = 40 + 2 * axis;
            raw[offset..offset + 2].copy_from_slice(&i16::MAX.to_le_bytes());
        }
        raw[344..348].copy_from_slice(b"n+1\0");
        std::fs::write(&path, raw).unwrap();

        assert!(matches!(
            gate().inspect(&produced(ArtifactType::Nifti, &path), None),
            Err(ValidationError::Unreadable(_))
        ));
    }

    #[test]
    fn test_seg_without_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.dcm");
        std::fs::write(&path, b"not dicom").unwrap();
        assert_eq!(
            gate().inspect(&produced(ArtifactType::Seg, &path), None),
            Err(ValidationError::NotDicom)
        );
    }

    #[test]
    fn test_report_apply() {
        let mut metadata = ArtifactMetadata {
            files: vec!["a.nii".to_string()],
            ..Default::default()
        };
        ValidationReport {
            label_count: Some(12),
            ..Default::default()
        }
        .apply(&mut metadata);
        assert_eq!(metadata.label_count, Some(12));
        assert_eq!(metadata.files.len(), 1);
    }
}
