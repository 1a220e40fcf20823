//! Stage adapters wrapping the external imaging tools.
//!
//! Each adapter turns one tool invocation into a single deadline-bound,
//! cancellable call that either publishes an output directory or reports a
//! typed [`AdapterError`].
//!
//! # Adapters
//!
//! | Stage       | Adapter                 | Tool                |
//! |-------------|-------------------------|---------------------|
//! | preprocess  | [`Dcm2niixAdapter`]     | `dcm2niix`          |
//! | infer       | [`TotalSpineSegAdapter`]| `totalspineseg`     |
//! | postprocess | [`SegConverterAdapter`] | `itkimage2segimage` |
//! | store       | [`PacsStoreAdapter`]    | `storescu`          |
//!
//! # Example
//!
//! ```ignore
//! use worklist_core::adapter::{build_adapters, PacsConfig, ToolsConfig};
//!
//! let adapters = build_adapters(&ToolsConfig::default(), &PacsConfig::default());
//! for (tool, error) in adapters.validate_all().await {
//!     eprintln!("{} unavailable: {}", tool, error);
//! }
//! ```

mod config;
mod dcm2niix;
mod error;
mod itk_seg;
mod pacs;
mod process;
mod totalspineseg;
mod traits;

use std::sync::Arc;

pub use config::{
    Dcm2niixConfig, PacsConfig, SegConverterConfig, SegTemplate, TotalSpineSegConfig,
    ToolsConfig,
};
pub use dcm2niix::Dcm2niixAdapter;
pub use error::AdapterError;
pub use itk_seg::{descriptor_fields, SegConverterAdapter};
pub use pacs::PacsStoreAdapter;
pub use process::{sha256_file, StagingDir, ToolCommand, ToolOutput};
pub use totalspineseg::TotalSpineSegAdapter;
pub use traits::{AdapterSet, ProducedArtifact, StageAdapter, StageOutput, StageRequest};

/// Builds the production adapter set from configuration.
pub fn build_adapters(tools: &ToolsConfig, pacs: &PacsConfig) -> AdapterSet {
    AdapterSet::new(
        Arc::new(Dcm2niixAdapter::new(tools.dcm2niix.clone())),
        Arc::new(TotalSpineSegAdapter::new(tools.totalspineseg.clone())),
        Arc::new(SegConverterAdapter::new(tools.itkimage2segimage.clone())),
        Arc::new(PacsStoreAdapter::new(pacs.clone())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Stage;

    #[test]
    fn test_build_adapters_covers_every_stage() {
        let adapters = build_adapters(&ToolsConfig::default(), &PacsConfig::default());
        for stage in Stage::ALL {
            assert_eq!(adapters.get(stage).stage(), stage);
        }
        assert_eq!(adapters.get(Stage::Infer).name(), "totalspineseg");
        assert!(!adapters.get(Stage::Store).supports_abort());
    }

    #[tokio::test]
    async fn test_validate_all_reports_missing_tools() {
        let tools = ToolsConfig {
            dcm2niix: Dcm2niixConfig {
                path: "/nonexistent/dcm2niix".into(),
                ..Default::default()
            },
            totalspineseg: TotalSpineSegConfig {
                path: "/nonexistent/totalspineseg".into(),
                ..Default::default()
            },
            itkimage2segimage: SegConverterConfig {
                path: "/nonexistent/itkimage2segimage".into(),
                ..Default::default()
            },
        };
        let pacs = PacsConfig {
            storescu_path: "/nonexistent/storescu".into(),
            ..Default::default()
        };

        let failures = build_adapters(&tools, &pacs).validate_all().await;
        assert_eq!(failures.len(), 4);
        assert!(failures
            .iter()
            .all(|(_, e)| matches!(e, AdapterError::ToolNotFound { .. })));
    }
}
