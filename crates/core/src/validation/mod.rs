//! Validation gate for stage outputs.
//!
//! A stage's output becomes the next stage's input only after the gate
//! accepts it. Checks depend on the artifact type:
//!
//! - NIfTI volume: readable header, non-empty grid, spacing and matrix
//!   consistent with the source series
//! - Segmentation: same grid as the input volume, enough distinct labels
//! - DICOM-SEG: read back from the written file; modality, descriptor
//!   fields, one segment per label, checksum
//!
//! Every rejection is permanent; retrying the stage cannot fix it.

mod config;
pub mod dicom;
mod gate;
pub mod nifti;

pub use config::ValidationConfig;
pub use dicom::{DicomError, SegSummary};
pub use gate::{ValidationError, ValidationGate, ValidationReport, GRID_TOLERANCE_MM};
pub use nifti::{NiftiError, NiftiHeader};
