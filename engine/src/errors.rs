//! Error types for the deployment engine

use std::time::Duration;

use thiserror::Error;

/// Main error type for the deployment engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Compose error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Source resolution error: {0}")]
    SourceResolution(String),

    #[error("Deployment error: {0}")]
    Deployment(String),

    #[error("Remote command exited with code {exit_code}: {stderr}")]
    RemoteCommand { exit_code: i32, stderr: String },

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Build a validation error for a named field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether this error is an expected, user-facing orchestration failure.
    ///
    /// Expected failures (build errors, unhealthy containers, nonzero remote
    /// exits, unreachable sources) are already surfaced through deployment
    /// status and are kept out of the operator alerting channel. Everything
    /// else may indicate an engine bug and is escalated.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            EngineError::Validation { .. }
                | EngineError::SourceResolution(_)
                | EngineError::Deployment(_)
                | EngineError::RemoteCommand { .. }
                | EngineError::Proxy(_)
                | EngineError::Timeout(_)
        )
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}
