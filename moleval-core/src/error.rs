//! Error types for the moleval-core crate.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for evaluation operations.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The metrics artifact is already on disk and overwrite was not requested.
    #[error("Metrics artifact already exists: {}", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Sampling error: {0}")]
    Sampling(String),

    #[error("Scoring error: {0}")]
    Scoring(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Python worker error: {0}")]
    Python(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl EvalError {
    pub fn model_load(msg: impl Into<String>) -> Self {
        Self::ModelLoad(msg.into())
    }

    pub fn sampling(msg: impl Into<String>) -> Self {
        Self::Sampling(msg.into())
    }

    pub fn scoring(msg: impl Into<String>) -> Self {
        Self::Scoring(msg.into())
    }

    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn python(msg: impl Into<String>) -> Self {
        Self::Python(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// True for the benign "artifact already there" condition.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

impl From<Box<figment::Error>> for EvalError {
    fn from(err: Box<figment::Error>) -> Self {
        Self::Config(err.to_string())
    }
}
