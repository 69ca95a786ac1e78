//! Error types shared across the EBD workspace

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for EBD operations
pub type Result<T> = std::result::Result<T, EbdError>;

/// Main error type for shared EBD utilities
#[derive(Error, Debug)]
pub enum EbdError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to publish {path}: {source}")]
    Publish {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
