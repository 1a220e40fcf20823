//! Pipeline locations.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where studies are read from and stage outputs are written to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root holding one DICOM directory per study reference.
    #[serde(default = "default_dicom_root")]
    pub dicom_root: PathBuf,

    /// Root of the per-job working directories.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

fn default_dicom_root() -> PathBuf {
    PathBuf::from("/data/dicom")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/data/work")
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dicom_root: default_dicom_root(),
            work_dir: default_work_dir(),
        }
    }
}

impl PipelineConfig {
    /// DICOM directory of a study.
    pub fn dicom_dir(&self, study_reference: &str) -> PathBuf {
        self.dicom_root.join(study_reference)
    }

    /// Working directory of a job.
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.work_dir.join(job_id)
    }

    pub fn is_under_work_dir(&self, path: &Path) -> bool {
        path.starts_with(&self.work_dir)
    }
}
