//! Validation gate configuration.

use serde::{Deserialize, Serialize};

/// Thresholds applied to stage outputs before the job may advance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Minimum distinct non-zero labels in a segmentation.
    #[serde(default = "default_min_labels")]
    pub min_labels: u32,

    /// Reject NIfTI volumes whose source geometry is unknown.
    #[serde(default = "default_require_source_geometry")]
    pub require_source_geometry: bool,

    /// Allowed difference between volume slice spacing and the source's.
    #[serde(default = "default_spacing_tolerance_mm")]
    pub spacing_tolerance_mm: f32,

    /// Descriptor fields that must be non-empty on a DICOM-SEG.
    #[serde(default = "default_required_seg_fields")]
    pub required_seg_fields: Vec<String>,
}

fn default_min_labels() -> u32 {
    10
}

fn default_require_source_geometry() -> bool {
    true
}

fn default_spacing_tolerance_mm() -> f32 {
    0.1
}

fn default_required_seg_fields() -> Vec<String> {
    ["ContentCreatorName", "SeriesDescription", "SeriesNumber", "BodyPartExamined"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_labels: default_min_labels(),
            require_source_geometry: default_require_source_geometry(),
            spacing_tolerance_mm: default_spacing_tolerance_mm(),
            required_seg_fields: default_required_seg_fields(),
        }
    }
}
