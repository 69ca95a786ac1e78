//! Structural pipeline errors
//!
//! Per-row problems never surface here; they are tallied in the stage
//! statistics instead (see [`crate::parser::RowError`]).

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Common(#[from] ebd_common::EbdError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Aggregation engine error: {0}")]
    Engine(duckdb::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{} is missing required columns: {}", .file.display(), .columns.join(", "))]
    MissingColumns { file: PathBuf, columns: Vec<String> },

    #[error("Reference data unavailable: {0}")]
    MissingReference(String),

    #[error("Stage '{stage}' is missing input {}", .path.display())]
    MissingInput { stage: String, path: PathBuf },

    #[error("Resource limit exceeded: {0}")]
    ResourceExhausted(String),

    #[error("HTTP error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("eBird API returned {status} for {url}")]
    Api { status: u16, url: String },

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Aggregation aborted: {0}")]
    Aborted(String),
}

impl From<duckdb::Error> for PipelineError {
    /// DuckDB reports a hit memory limit as an "Out of Memory Error"
    fn from(err: duckdb::Error) -> Self {
        let message = err.to_string();
        if message.contains("Out of Memory") {
            PipelineError::ResourceExhausted(format!("aggregation engine: {}", message))
        } else {
            PipelineError::Engine(err)
        }
    }
}

impl PipelineError {
    /// Map an IO failure during scratch setup or writing, promoting a full
    /// disk to [`PipelineError::ResourceExhausted`]
    pub fn from_io_with_context(err: std::io::Error, context: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::StorageFull | std::io::ErrorKind::OutOfMemory => {
                PipelineError::ResourceExhausted(format!("{}: {}", context, err))
            },
            _ => PipelineError::Io(err),
        }
    }
}
