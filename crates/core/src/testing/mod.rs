//! Testing utilities and mock implementations for E2E tests.
//!
//! [`MockAdapter`] stands in for the external tools so whole jobs can run
//! through the orchestrator and scheduler without dcm2niix, TotalSpineSeg,
//! itkimage2segimage or a PACS.
//!
//! # Example
//!
//! ```rust,ignore
//! use worklist_core::testing::{MockAdapter, MockFailure, MockStep};
//!
//! let infer = MockAdapter::new(Stage::Infer);
//! infer
//!     .push_steps([MockStep::Fail(MockFailure::ExitCode(1)), MockStep::Succeed])
//!     .await;
//!
//! let adapters = mock_adapter_set(&[preprocess, infer, postprocess, store]);
//! ```

mod mock_adapter;

pub use mock_adapter::{MockAdapter, MockFailure, MockStep, RecordedCall};

use std::sync::Arc;

use crate::adapter::AdapterSet;

/// Builds an adapter set from one mock per stage, in stage order.
pub fn mock_adapter_set(adapters: &[Arc<MockAdapter>; 4]) -> AdapterSet {
    AdapterSet::new(
        adapters[0].clone(),
        adapters[1].clone(),
        adapters[2].clone(),
        adapters[3].clone(),
    )
}

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::collections::BTreeMap;
    use std::io::{self, Write};
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use chrono::Utc;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use sha2::{Digest, Sha256};

    use crate::adapter::{descriptor_fields, ProducedArtifact, SegTemplate, StageRequest};
    use crate::config::Config;
    use crate::job::{
        file_uri, Artifact, ArtifactMetadata, ArtifactType, JobOptions, SourceGeometry, Stage,
        VoxelGrid,
    };
    use crate::validation::dicom::{self, Tag};

    const VOX_OFFSET: usize = 352;

    /// Shape and content of a synthetic NIfTI volume.
    #[derive(Debug, Clone, PartialEq)]
    pub struct NiftiSpec {
        pub dims: [u32; 3],
        pub spacing: [f32; 3],
        /// Voxel values, repeated over the whole volume. Empty means all zero.
        pub labels: Vec<i64>,
    }

    impl NiftiSpec {
        pub fn new(dims: [u32; 3], spacing: [f32; 3]) -> Self {
            Self {
                dims,
                spacing,
                labels: Vec::new(),
            }
        }

        pub fn with_labels(mut self, labels: &[i64]) -> Self {
            self.labels = labels.to_vec();
            self
        }

        pub fn grid(&self) -> VoxelGrid {
            VoxelGrid {
                dims: self.dims,
                spacing: self.spacing,
            }
        }

        /// Little-endian uint8 NIfTI-1 bytes.
        pub fn to_bytes(&self) -> Vec<u8> {
            let mut header = [0u8; 348];
            header[0..4].copy_from_slice(&348i32.to_le_bytes());

            let dim: [i16; 8] = [
                3,
                self.dims[0] as i16,
                self.dims[1] as i16,
                self.dims[2] as i16,
                1,
                1,
                1,
                1,
            ];
            for (i, value) in dim.iter().enumerate() {
                header[40 + 2 * i..42 + 2 * i].copy_from_slice(&value.to_le_bytes());
            }
            header[70..72].copy_from_slice(&2i16.to_le_bytes()); // uint8
            header[72..74].copy_from_slice(&8i16.to_le_bytes());

            let pixdim: [f32; 8] = [
                1.0,
                self.spacing[0],
                self.spacing[1],
                self.spacing[2],
                0.0,
                0.0,
                0.0,
                0.0,
            ];
            for (i, value) in pixdim.iter().enumerate() {
                header[76 + 4 * i..80 + 4 * i].copy_from_slice(&value.to_le_bytes());
            }
            header[108..112].copy_from_slice(&(VOX_OFFSET as f32).to_le_bytes());
            header[344..348].copy_from_slice(b"n+1\0");

            let voxels = self.grid().voxel_count() as usize;
            let mut bytes = Vec::with_capacity(VOX_OFFSET + voxels);
            bytes.extend_from_slice(&header);
            bytes.extend_from_slice(&[0u8; VOX_OFFSET - 348]);
            if self.labels.is_empty() {
                bytes.resize(VOX_OFFSET + voxels, 0);
            } else {
                bytes.extend(self.labels.iter().cycle().take(voxels).map(|&l| l as u8));
            }
            bytes
        }
    }

    pub fn write_nifti(path: &Path, spec: &NiftiSpec) -> io::Result<()> {
        std::fs::write(path, spec.to_bytes())
    }

    pub fn write_nifti_gz(path: &Path, spec: &NiftiSpec) -> io::Result<()> {
        let mut encoder = GzEncoder::new(std::fs::File::create(path)?, Compression::fast());
        encoder.write_all(&spec.to_bytes())?;
        encoder.finish()?;
        Ok(())
    }

    fn push_element(out: &mut Vec<u8>, tag: Tag, vr: [u8; 2], value: &[u8]) {
        let mut value = value.to_vec();
        if value.len() % 2 == 1 {
            value.push(if &vr == b"UI" { 0 } else { b' ' });
        }
        out.extend_from_slice(&tag.0.to_le_bytes());
        out.extend_from_slice(&tag.1.to_le_bytes());
        out.extend_from_slice(&vr);
        if dicom::has_long_length(&vr) {
            out.extend_from_slice(&[0, 0]);
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        } else {
            out.extend_from_slice(&(value.len() as u16).to_le_bytes());
        }
        out.extend_from_slice(&value);
    }

    fn push_delimiter(out: &mut Vec<u8>, tag: Tag, length: u32) {
        out.extend_from_slice(&tag.0.to_le_bytes());
        out.extend_from_slice(&tag.1.to_le_bytes());
        out.extend_from_slice(&length.to_le_bytes());
    }

    /// DICOM-SEG with the default descriptor and `segments` segments.
    pub fn write_seg(path: &Path, segments: u32) -> io::Result<()> {
        write_seg_with(path, &descriptor_fields(&SegTemplate::default()), segments)
    }

    /// Explicit VR little endian DICOM-SEG carrying the descriptor attributes
    /// in `fields` and `segments` items in its Segment Sequence.
    pub fn write_seg_with(
        path: &Path,
        fields: &BTreeMap<String, String>,
        segments: u32,
    ) -> io::Result<()> {
        let mut meta = Vec::new();
        push_element(
            &mut meta,
            dicom::MEDIA_STORAGE_SOP_CLASS_UID,
            *b"UI",
            dicom::SEGMENTATION_STORAGE.as_bytes(),
        );
        push_element(
            &mut meta,
            dicom::TRANSFER_SYNTAX_UID,
            *b"UI",
            dicom::EXPLICIT_VR_LITTLE_ENDIAN.as_bytes(),
        );

        let mut sequence = Vec::new();
        for number in 1..=segments {
            push_delimiter(&mut sequence, dicom::ITEM, dicom::UNDEFINED_LENGTH);
            push_element(
                &mut sequence,
                dicom::SEGMENT_NUMBER,
                *b"US",
                &(number as u16).to_le_bytes(),
            );
            push_delimiter(&mut sequence, dicom::ITEM_DELIMITER, 0);
        }

        let mut dataset: Vec<(Tag, [u8; 2], Vec<u8>)> =
            vec![(dicom::MODALITY, *b"CS", b"SEG".to_vec())];
        for (keyword, tag, vr) in dicom::DESCRIPTOR_ATTRIBUTES {
            if let Some(value) = fields.get(*keyword) {
                dataset.push((*tag, *vr, value.as_bytes().to_vec()));
            }
        }
        dataset.push((dicom::SEGMENT_SEQUENCE, *b"SQ", sequence));
        dataset.push((dicom::PIXEL_DATA, *b"OB", vec![0u8; 2]));
        dataset.sort_by_key(|(tag, ..)| *tag);

        let mut bytes = vec![0u8; 128];
        bytes.extend_from_slice(b"DICM");
        push_element(
            &mut bytes,
            dicom::FILE_META_GROUP_LENGTH,
            *b"UL",
            &(meta.len() as u32).to_le_bytes(),
        );
        bytes.extend_from_slice(&meta);
        for (tag, vr, value) in &dataset {
            push_element(&mut bytes, *tag, *vr, value);
        }
        std::fs::write(path, bytes)
    }

    /// BIDS sidecar as dcm2niix writes it next to a volume.
    pub fn write_sidecar(path: &Path, geometry: &SourceGeometry) -> io::Result<()> {
        let mut sidecar = serde_json::Map::new();
        sidecar.insert("Modality".to_string(), "MR".into());
        if let Some(spacing) = geometry.slice_spacing_mm {
            sidecar.insert("SliceThickness".to_string(), f64::from(spacing).into());
        }
        if let Some(matrix) = geometry.in_plane_matrix {
            sidecar.insert("ReconMatrixPE".to_string(), matrix.into());
        }
        std::fs::write(path, serde_json::Value::Object(sidecar).to_string())
    }

    /// Configuration rooted in `dir` with millisecond timings.
    ///
    /// Slot waits, requeue delays, polls and backoffs are short enough for a
    /// whole pipeline to run inside a test.
    pub fn harness_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.server.host = std::net::Ipv4Addr::LOCALHOST.into();
        config.database.path = dir.join("worklist.db");
        config.pipeline.dicom_root = dir.join("dicom");
        config.pipeline.work_dir = dir.join("work");

        config.scheduler.workers = 4;
        config.scheduler.slot_wait_ms = 200;
        config.scheduler.requeue_delay_ms = 20;
        config.scheduler.lease_ttl_ms = 5_000;
        config.scheduler.poll_interval_ms = 50;
        config.scheduler.cancel_check_interval_ms = 20;
        config.scheduler.instance_id = Some("harness".to_string());

        for policy in [
            &mut config.retry.preprocess,
            &mut config.retry.infer,
            &mut config.retry.postprocess,
            &mut config.retry.store,
        ] {
            policy.base_backoff_ms = 10;
            policy.max_backoff_ms = 20;
            policy.timeout_ms = 5_000;
        }
        config
    }

    /// Writes an executable `/bin/sh` script standing in for an external tool.
    pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub fn sha256_hex(path: &Path) -> String {
        let bytes = std::fs::read(path).unwrap();
        format!("{:x}", Sha256::digest(&bytes))
    }

    /// Request for attempt 1 with default options and an hour until the deadline.
    pub fn stage_request(
        stage: Stage,
        job_dir: &Path,
        dicom_dir: &Path,
        input: Option<Artifact>,
    ) -> StageRequest {
        StageRequest {
            job_id: "job-1".to_string(),
            stage,
            attempt: 1,
            study_reference: "1.2.840.113619.2.55".to_string(),
            dicom_dir: dicom_dir.to_path_buf(),
            input,
            options: JobOptions::default(),
            deadline: tokio::time::Instant::now() + Duration::from_secs(3600),
            job_dir: job_dir.to_path_buf(),
        }
    }

    fn artifact(job_id: &str, stage: Stage, artifact_type: ArtifactType, path: &Path) -> Artifact {
        Artifact {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            stage,
            artifact_type,
            location: file_uri(path),
            checksum: sha256_hex(path),
            produced_at: Utc::now(),
            metadata: ArtifactMetadata::default(),
        }
    }

    /// Converted volume named `name` in `dir`. Gzipped when `name` ends in `.gz`.
    pub fn nifti_artifact(dir: &Path, job_id: &str, name: &str) -> Artifact {
        let spec = NiftiSpec::new([8, 8, 4], [1.0, 1.0, 3.0]);
        let path = dir.join(name);
        if name.ends_with(".gz") {
            write_nifti_gz(&path, &spec).unwrap();
        } else {
            write_nifti(&path, &spec).unwrap();
        }
        let mut artifact = artifact(job_id, Stage::Preprocess, ArtifactType::Nifti, &path);
        artifact.metadata.grid = Some(spec.grid());
        artifact
    }

    /// Converted volume with the given shape, grid recorded in its metadata.
    pub fn nifti_artifact_with(dir: &Path, job_id: &str, spec: &NiftiSpec) -> Artifact {
        let path = dir.join(format!("volume-{}.nii", uuid::Uuid::new_v4().simple()));
        write_nifti(&path, spec).unwrap();
        let mut artifact = artifact(job_id, Stage::Preprocess, ArtifactType::Nifti, &path);
        artifact.metadata.grid = Some(spec.grid());
        artifact
    }

    /// Labelled segmentation volume containing `labels` (plus background).
    pub fn segmentation_artifact(dir: &Path, job_id: &str, labels: &[i64]) -> Artifact {
        let mut values = vec![0];
        values.extend_from_slice(labels);
        let spec = NiftiSpec::new([8, 8, 4], [1.0, 1.0, 3.0]).with_labels(&values);
        let path = dir.join("segmentation.nii");
        write_nifti(&path, &spec).unwrap();

        let mut artifact = artifact(job_id, Stage::Infer, ArtifactType::Segmentation, &path);
        artifact.metadata.grid = Some(spec.grid());
        artifact.metadata.label_count = Some(labels.len() as u32);
        artifact
    }

    /// Validated DICOM-SEG with `segment_count` segments.
    pub fn seg_artifact(dir: &Path, job_id: &str, segment_count: u32) -> Artifact {
        let path = dir.join("seg.dcm");
        write_seg(&path, segment_count).unwrap();

        let mut artifact = artifact(job_id, Stage::Postprocess, ArtifactType::Seg, &path);
        artifact.metadata.segment_count = Some(segment_count);
        artifact.metadata.seg_fields = descriptor_fields(&SegTemplate::default());
        artifact
    }

    /// Unvalidated output for `path`, as an adapter would report it.
    pub fn produced(artifact_type: ArtifactType, path: &Path) -> ProducedArtifact {
        ProducedArtifact {
            artifact_type,
            path: path.to_path_buf(),
            output_dir: path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
            checksum: sha256_hex(path),
            metadata: ArtifactMetadata {
                seg_fields: BTreeMap::new(),
                ..Default::default()
            },
        }
    }
}
