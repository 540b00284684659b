//! Error types for the deployment engine

use thiserror::Error;

/// Main error type for the deployment engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Dial or authentication failure. Never retried.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// A remote command exited non-zero and the caller classified it as fatal
    #[error("Command failed (exit {exit_code}): {command}: {output}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// Best-effort cleanup where some steps failed
    #[error("Partial failure: {}", .0.join("; "))]
    PartialFailure(Vec<String>),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Gateway error: {0}")]
    GatewayError(String),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Refresh queue is full")]
    QueueFull,

    #[error("Refresh pool is stopped")]
    PoolStopped,

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// True for errors caused by a missing key, record or release
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}
