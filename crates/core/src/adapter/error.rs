//! Error types for stage adapters.

use std::path::PathBuf;
use thiserror::Error;

/// Errors a stage adapter can report.
///
/// Classification into retry behaviour happens in [`crate::retry`].
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Tool binary could not be started.
    #[error("{tool} not found at path: {path}")]
    ToolNotFound { tool: String, path: PathBuf },

    /// Input is missing or unusable for this stage.
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    /// Tool exited successfully but its expected output is absent.
    #[error("{tool} produced no usable output: {reason}")]
    MissingOutput { tool: String, reason: String },

    /// Tool exited with a failure status. `exit_code` is `None` when killed by a signal.
    #[error("{tool} failed with exit code {exit_code:?}")]
    ExternalTool {
        tool: String,
        exit_code: Option<i32>,
        stderr: Option<String>,
    },

    /// Deadline passed before the tool finished.
    #[error("{tool} timed out after {timeout_ms} ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// A resource the tool needs is temporarily unavailable.
    #[error("Resource exhausted: {reason}")]
    ResourceExhausted { reason: String },

    /// Archive accepted the transfer but never confirmed the store.
    #[error("Store not acknowledged: {reason}")]
    NotAcknowledged { reason: String },

    /// Archive answered the store request with a failure status.
    #[error("PACS rejected store: {status}")]
    PacsRejected { status: String },

    /// I/O error while staging input or output.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Execution aborted by a cancel request.
    #[error("Execution cancelled")]
    Cancelled,
}

impl AdapterError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn missing_output(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MissingOutput {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    pub fn resource_exhausted(reason: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            reason: reason.into(),
        }
    }

    pub fn not_acknowledged(reason: impl Into<String>) -> Self {
        Self::NotAcknowledged {
            reason: reason.into(),
        }
    }

    /// Exit code of a failed external tool, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ExternalTool { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    /// Message for the job's error record, with the stderr tail when present.
    pub fn detail(&self) -> String {
        match self {
            Self::ExternalTool {
                stderr: Some(stderr),
                ..
            } if !stderr.trim().is_empty() => format!("{}: {}", self, stderr.trim()),
            _ => self.to_string(),
        }
    }
}
