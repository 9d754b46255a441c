use std::time::Duration;

use thiserror::Error;

/// Core error type for CHAOS operations.
#[derive(Error, Debug)]
pub enum ChaosError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Listener error: {0}")]
    Listener(String),

    #[error("Timed out after {after:?}: {operation}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChaosError {
    /// Build a timeout error for the named operation.
    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        ChaosError::Timeout { operation, after }
    }

    /// Whether this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ChaosError::Timeout { .. })
    }
}

impl From<serde_json::Error> for ChaosError {
    fn from(e: serde_json::Error) -> Self {
        ChaosError::Serialization(e.to_string())
    }
}

/// Result type alias using ChaosError.
pub type Result<T> = std::result::Result<T, ChaosError>;
