//! Configuration for the tool adapters.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// External tool configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub dcm2niix: Dcm2niixConfig,
    #[serde(default)]
    pub totalspineseg: TotalSpineSegConfig,
    #[serde(default)]
    pub itkimage2segimage: SegConverterConfig,
}

/// DICOM to NIfTI conversion via dcm2niix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dcm2niixConfig {
    /// Path to dcm2niix binary.
    #[serde(default = "default_dcm2niix_path")]
    pub path: PathBuf,

    /// Output filename pattern (`-f`).
    #[serde(default = "default_filename_format")]
    pub filename_format: String,

    /// NIfTI files smaller than this are treated as conversion failures.
    #[serde(default = "default_min_output_bytes")]
    pub min_output_bytes: u64,

    /// Additional arguments placed before the input directory.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_dcm2niix_path() -> PathBuf {
    PathBuf::from("dcm2niix")
}

fn default_filename_format() -> String {
    "%p_%s_%d".to_string()
}

fn default_min_output_bytes() -> u64 {
    1024
}

impl Default for Dcm2niixConfig {
    fn default() -> Self {
        Self {
            path: default_dcm2niix_path(),
            filename_format: default_filename_format(),
            min_output_bytes: default_min_output_bytes(),
            extra_args: Vec::new(),
        }
    }
}

/// Spine segmentation via TotalSpineSeg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotalSpineSegConfig {
    /// Path to totalspineseg binary.
    #[serde(default = "default_totalspineseg_path")]
    pub path: PathBuf,

    /// Model weights directory, exported as `TOTALSPINESEG_DATA`.
    #[serde(default)]
    pub model_dir: Option<PathBuf>,

    /// Additional arguments (e.g. `--step1`).
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Inputs smaller than this are logged as suspicious.
    #[serde(default = "default_small_input_bytes")]
    pub small_input_bytes: u64,

    /// Stderr fragments that mean the accelerator ran out of memory.
    #[serde(default = "default_oom_markers")]
    pub oom_markers: Vec<String>,
}

fn default_totalspineseg_path() -> PathBuf {
    PathBuf::from("totalspineseg")
}

fn default_small_input_bytes() -> u64 {
    1024 * 1024
}

fn default_oom_markers() -> Vec<String> {
    vec![
        "CUDA out of memory".to_string(),
        "OutOfMemoryError".to_string(),
    ]
}

impl Default for TotalSpineSegConfig {
    fn default() -> Self {
        Self {
            path: default_totalspineseg_path(),
            model_dir: None,
            extra_args: Vec::new(),
            small_input_bytes: default_small_input_bytes(),
            oom_markers: default_oom_markers(),
        }
    }
}

/// NIfTI to DICOM-SEG conversion via dcmqi's itkimage2segimage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegConverterConfig {
    /// Path to itkimage2segimage binary.
    #[serde(default = "default_itkimage2segimage_path")]
    pub path: PathBuf,

    /// Skip empty slices (`--skip`).
    #[serde(default = "default_true")]
    pub skip_empty_slices: bool,

    /// Descriptor fields written into the metadata JSON.
    #[serde(default)]
    pub template: SegTemplate,
}

fn default_itkimage2segimage_path() -> PathBuf {
    PathBuf::from("itkimage2segimage")
}

fn default_true() -> bool {
    true
}

impl Default for SegConverterConfig {
    fn default() -> Self {
        Self {
            path: default_itkimage2segimage_path(),
            skip_empty_slices: true,
            template: SegTemplate::default(),
        }
    }
}

/// DICOM-SEG series descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegTemplate {
    #[serde(default = "default_content_creator")]
    pub content_creator_name: String,
    #[serde(default = "default_series_id")]
    pub clinical_trial_series_id: String,
    #[serde(default = "default_time_point_id")]
    pub clinical_trial_time_point_id: String,
    #[serde(default = "default_series_description")]
    pub series_description: String,
    #[serde(default = "default_series_number")]
    pub series_number: String,
    #[serde(default = "default_instance_number")]
    pub instance_number: String,
    #[serde(default = "default_body_part")]
    pub body_part_examined: String,
    #[serde(default = "default_algorithm_name")]
    pub algorithm_name: String,
}

fn default_content_creator() -> String {
    "SpineAISystem".to_string()
}

fn default_series_id() -> String {
    "SpineSegmentation".to_string()
}

fn default_time_point_id() -> String {
    "1".to_string()
}

fn default_series_description() -> String {
    "AI Spine Segmentation".to_string()
}

fn default_series_number() -> String {
    "1001".to_string()
}

fn default_instance_number() -> String {
    "1".to_string()
}

fn default_body_part() -> String {
    "SPINE".to_string()
}

fn default_algorithm_name() -> String {
    "TotalSpineSeg".to_string()
}

impl Default for SegTemplate {
    fn default() -> Self {
        Self {
            content_creator_name: default_content_creator(),
            clinical_trial_series_id: default_series_id(),
            clinical_trial_time_point_id: default_time_point_id(),
            series_description: default_series_description(),
            series_number: default_series_number(),
            instance_number: default_instance_number(),
            body_part_examined: default_body_part(),
            algorithm_name: default_algorithm_name(),
        }
    }
}

/// PACS destination, reached through DCMTK's storescu.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacsConfig {
    /// Path to storescu binary.
    #[serde(default = "default_storescu_path")]
    pub storescu_path: PathBuf,

    #[serde(default = "default_pacs_host")]
    pub host: String,

    #[serde(default = "default_pacs_port")]
    pub port: u16,

    /// Called AE title (the archive).
    #[serde(default = "default_called_ae")]
    pub called_ae: String,

    /// Calling AE title (this service).
    #[serde(default = "default_calling_ae")]
    pub calling_ae: String,

    /// Additional storescu arguments.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_storescu_path() -> PathBuf {
    PathBuf::from("storescu")
}

fn default_pacs_host() -> String {
    "localhost".to_string()
}

fn default_pacs_port() -> u16 {
    104
}

fn default_called_ae() -> String {
    "PACS".to_string()
}

fn default_calling_ae() -> String {
    "WORKLIST".to_string()
}

impl Default for PacsConfig {
    fn default() -> Self {
        Self {
            storescu_path: default_storescu_path(),
            host: default_pacs_host(),
            port: default_pacs_port(),
            called_ae: default_called_ae(),
            calling_ae: default_calling_ae(),
            extra_args: Vec::new(),
        }
    }
}

impl PacsConfig {
    /// `AE@host:port` form used in receipts and logs.
    pub fn destination(&self) -> String {
        format!("{}@{}:{}", self.called_ae, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let tools = ToolsConfig::default();
        assert_eq!(tools.dcm2niix.path, PathBuf::from("dcm2niix"));
        assert_eq!(tools.dcm2niix.filename_format, "%p_%s_%d");
        assert_eq!(tools.dcm2niix.min_output_bytes, 1024);
        assert!(tools.totalspineseg.model_dir.is_none());
        assert!(tools.itkimage2segimage.skip_empty_slices);
        assert_eq!(
            tools.itkimage2segimage.template.content_creator_name,
            "SpineAISystem"
        );
    }

    #[test]
    fn test_partial_toml() {
        let tools: ToolsConfig = toml::from_str(
            r#"
[totalspineseg]
model_dir = "/opt/models"

[itkimage2segimage.template]
series_number = "2001"
"#,
        )
        .unwrap();
        assert_eq!(
            tools.totalspineseg.model_dir,
            Some(PathBuf::from("/opt/models"))
        );
        assert_eq!(tools.itkimage2segimage.template.series_number, "2001");
        assert_eq!(tools.itkimage2segimage.template.body_part_examined, "SPINE");
    }

    #[test]
    fn test_pacs_destination() {
        let pacs = PacsConfig {
            host: "archive.local".to_string(),
            port: 11112,
            ..Default::default()
        };
        assert_eq!(pacs.destination(), "PACS@archive.local:11112");
    }
}
