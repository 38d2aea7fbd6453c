//! Error taxonomy for sandbox runs.
//!
//! Every variant is an infrastructure failure: the sandbox could not run the
//! submitted code. Code that runs and fails on its own terms is reported as a
//! successful [`RunResult`](crate::sandbox::RunResult) with stderr populated.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// Malformed request. Raised before any directory or process is created.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to download {url}: {reason}")]
    Download { url: String, reason: String },

    /// Package installation failed. A session keeps its partial environment.
    #[error("environment build failed: {stderr}")]
    EnvironmentBuild { stderr: String },

    #[error("execution timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl SandboxError {
    /// Stable tag for the error kind, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Validation(_) => "validation",
            SandboxError::NotFound(_) => "not_found",
            SandboxError::Download { .. } => "download",
            SandboxError::EnvironmentBuild { .. } => "environment_build",
            SandboxError::Timeout(_) => "timeout",
            SandboxError::Io(_) | SandboxError::Unexpected(_) => "unexpected",
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        SandboxError::Validation(msg.into())
    }
}

impl From<tokio::task::JoinError> for SandboxError {
    fn from(err: tokio::task::JoinError) -> Self {
        SandboxError::Unexpected(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
