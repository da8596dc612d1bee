//! Error types for deployd

use thiserror::Error;

/// Main error type for deployd
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Bad or missing webhook signature, bearer token or stream token
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// Malformed payload or request parameters
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A run for this deployment has not reached a terminal state yet
    #[error("Deployment already running: {0}")]
    AlreadyRunning(String),

    /// An external command exited non-zero
    #[error("Stage failed: {stage}: {message}")]
    StageFailure { stage: String, message: String },

    /// Lock unavailable, runtime unreachable, identity unresolvable
    #[error("Infrastructure error: {0}")]
    InfrastructureError(String),

    #[error("Notification error: {0}")]
    NotificationError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        DeployError::StageFailure {
            stage: stage.into(),
            message: message.into(),
        }
    }
}
