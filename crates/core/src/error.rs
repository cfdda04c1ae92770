//! Core error types

use thiserror::Error;

/// Core error type for GhostMesh
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration value rejected
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
