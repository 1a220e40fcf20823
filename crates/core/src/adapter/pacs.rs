//! PACS delivery with DCMTK's storescu.

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::PacsConfig;
use super::process::{probe_tool, run_tool, ToolCommand};
use super::{AdapterError, StageAdapter, StageOutput, StageRequest};
use crate::job::{ArtifactType, DeliveryReceipt, Stage};

const TOOL: &str = "storescu";

const STORE_RESPONSE: &str = "Received Store Response";

/// Status reported on a `Received Store Response (...)` line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StoreResponse {
    Success,
    Other(String),
}

/// Store adapter: sends the DICOM-SEG object to the configured archive.
///
/// A C-STORE cannot be recalled once sent, so this adapter runs to
/// completion even when the job is cancelled.
pub struct PacsStoreAdapter {
    config: PacsConfig,
}

impl PacsStoreAdapter {
    pub fn new(config: PacsConfig) -> Self {
        Self { config }
    }

    fn command(&self, seg_file: &std::path::Path) -> ToolCommand {
        ToolCommand::new(TOOL, &self.config.storescu_path)
            .arg("-v")
            .args(["-aet", self.config.calling_ae.as_str()])
            .args(["-aec", self.config.called_ae.as_str()])
            .args(&self.config.extra_args)
            .arg(&self.config.host)
            .arg(self.config.port.to_string())
            .arg(seg_file)
    }
}

/// Last store response status found in the tool's log output.
fn store_response(log: &str) -> Option<StoreResponse> {
    log.lines()
        .filter_map(|line| {
            let rest = &line[line.find(STORE_RESPONSE)? + STORE_RESPONSE.len()..];
            let status = rest
                .trim()
                .strip_prefix('(')
                .and_then(|s| s.split(')').next())
                .unwrap_or(rest.trim())
                .trim()
                .to_string();
            Some(if status == "Success" {
                StoreResponse::Success
            } else {
                StoreResponse::Other(status)
            })
        })
        .last()
}

#[async_trait]
impl StageAdapter for PacsStoreAdapter {
    fn name(&self) -> &str {
        TOOL
    }

    fn stage(&self) -> Stage {
        Stage::Store
    }

    fn supports_abort(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        request: StageRequest,
        cancel: CancellationToken,
    ) -> Result<StageOutput, AdapterError> {
        let seg_file = request.input_path()?;
        let artifact = request
            .input
            .as_ref()
            .ok_or_else(|| AdapterError::invalid_input("store stage requires a SEG artifact"))?;
        if artifact.artifact_type != ArtifactType::Seg {
            return Err(AdapterError::invalid_input(format!(
                "store stage expects a SEG artifact, got {}",
                artifact.artifact_type
            )));
        }

        let destination = self.config.destination();
        let command = self.command(&seg_file);

        let output = match run_tool(&command, request.deadline, &cancel).await {
            Ok(output) => output,
            Err(AdapterError::ExternalTool {
                tool,
                exit_code,
                stderr,
            }) => {
                // A failed association and an explicit rejection both exit non-zero
                if let Some(StoreResponse::Other(status)) =
                    stderr.as_deref().and_then(store_response)
                {
                    warn!("{} rejected SEG for job {}: {}", destination, request.job_id, status);
                    return Err(AdapterError::PacsRejected { status });
                }
                return Err(AdapterError::ExternalTool {
                    tool,
                    exit_code,
                    stderr,
                });
            }
            Err(e) => return Err(e),
        };

        let log = format!("{}\n{}", output.stdout, output.stderr);
        match store_response(&log) {
            Some(StoreResponse::Success) => {
                info!("Delivered SEG for job {} to {}", request.job_id, destination);
                Ok(StageOutput::Delivered(DeliveryReceipt {
                    artifact_id: artifact.id.clone(),
                    destination,
                    acknowledged_at: Utc::now(),
                    response: "Success".to_string(),
                }))
            }
            Some(StoreResponse::Other(status)) => {
                warn!("{} rejected SEG for job {}: {}", destination, request.job_id, status);
                Err(AdapterError::PacsRejected { status })
            }
            None => Err(AdapterError::not_acknowledged(format!(
                "{} exited without a store response from {}",
                TOOL, destination
            ))),
        }
    }

    async fn validate_tool(&self) -> Result<(), AdapterError> {
        probe_tool(
            &ToolCommand::new(TOOL, &self.config.storescu_path).arg("--version"),
            &[0],
        )
        .await
    }
}
