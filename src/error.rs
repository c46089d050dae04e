//! Error types for training operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during training and evaluation.
#[derive(Error, Debug)]
pub enum TrainError {
    /// Invalid or inconsistent configuration. Fatal, surfaced immediately.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A checkpoint required for resume/fine-tune/transfer does not exist.
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(PathBuf),

    /// A checkpoint file exists but could not be deserialized.
    #[error("Checkpoint corrupt: {0}")]
    CheckpointCorrupt(String),

    /// Error in checkpoint file I/O.
    #[error("Checkpoint I/O error: {0}")]
    CheckpointIo(String),

    /// Target distribution unusable for normalization (empty or zero variance).
    #[error("Degenerate normalization: {0}")]
    DegenerateNormalization(String),

    /// Error in loss computation.
    #[error("Loss computation error: {0}")]
    Loss(String),

    /// Error in optimizer operation.
    #[error("Optimizer error: {0}")]
    Optimizer(String),

    /// Error in model operations.
    #[error("Model error: {0}")]
    Model(String),

    /// Error in batch or loader handling.
    #[error("Data error: {0}")]
    Data(String),

    /// Error in metrics computation.
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

/// Result type for training operations.
pub type TrainResult<T> = Result<T, TrainError>;
