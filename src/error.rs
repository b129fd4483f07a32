//! Error types for the Kolosal NAS toolkit

use thiserror::Error;

/// Result type alias for Kolosal NAS operations
pub type Result<T> = std::result::Result<T, KolosalError>;

/// Main error type for the Kolosal NAS toolkit
#[derive(Error, Debug)]
pub enum KolosalError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Graph error: {0}")]
    GraphError(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Optimization error: {0}")]
    OptimizationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for KolosalError {
    fn from(err: serde_json::Error) -> Self {
        KolosalError::SerializationError(err.to_string())
    }
}
