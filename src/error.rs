//! Error types for the seisdec clustering pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for seisdec operations.
#[derive(Error, Debug)]
pub enum SeisdecError {
    /// Invalid or missing hyperparameter, path or option.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The sample store could not be read.
    #[error("Data access error: {0}")]
    DataAccess(String),

    /// Sample index past the end of the store.
    #[error("Index out of bounds: {index} >= {len}")]
    IndexOutOfBounds {
        /// The requested index.
        index: usize,
        /// Number of samples in the store.
        len: usize,
    },

    /// A loss, parameter or latent became NaN or infinite.
    #[error("Run {run} diverged during {stage}: {detail}")]
    Divergence {
        /// Identifier of the hyperparameter run.
        run: String,
        /// Training stage (`pretrain`, `dec_init` or `dec`).
        stage: String,
        /// Where the non-finite value showed up.
        detail: String,
    },

    /// Training could not proceed.
    #[error("Training error: {0}")]
    Training(String),

    /// Empty input.
    #[error("Empty input: {0}")]
    EmptyInput(String),

    /// Shape mismatch between a model and its input.
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    Shape {
        /// Expected shape or width.
        expected: String,
        /// Shape or width actually provided.
        actual: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// File not found.
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// Malformed checkpoint or store file.
    #[error("Invalid file format: {0}")]
    InvalidFormat(String),
}

impl SeisdecError {
    /// Returns true if this error means a run diverged.
    pub fn is_divergence(&self) -> bool {
        matches!(self, SeisdecError::Divergence { .. })
    }
}

/// Result type alias for seisdec operations.
pub type Result<T> = std::result::Result<T, SeisdecError>;

impl From<bincode::Error> for SeisdecError {
    fn from(err: bincode::Error) -> Self {
        SeisdecError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for SeisdecError {
    fn from(err: serde_json::Error) -> Self {
        SeisdecError::Serialization(err.to_string())
    }
}

impl From<csv::Error> for SeisdecError {
    fn from(err: csv::Error) -> Self {
        SeisdecError::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for SeisdecError {
    fn from(err: image::ImageError) -> Self {
        SeisdecError::Serialization(err.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for SeisdecError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        SeisdecError::Config(format!("thread pool: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_divergence_display() {
        let err = SeisdecError::Divergence {
            run: "bs32_lr0.001".to_string(),
            stage: "pretrain".to_string(),
            detail: "loss=NaN at epoch 3".to_string(),
        };
        assert!(err.is_divergence());
        assert_eq!(
            err.to_string(),
            "Run bs32_lr0.001 diverged during pretrain: loss=NaN at epoch 3"
        );
    }

    #[test]
    fn test_index_out_of_bounds_display() {
        let err = SeisdecError::IndexOutOfBounds { index: 10, len: 5 };
        assert!(!err.is_divergence());
        assert_eq!(err.to_string(), "Index out of bounds: 10 >= 5");
    }
}
