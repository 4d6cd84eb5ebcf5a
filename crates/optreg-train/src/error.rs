//! Error types for training, validation and checkpointing.

use std::path::PathBuf;

use optreg_core::CoreError;
use optreg_model::ModelError;
use thiserror::Error;

/// Main error type for training operations.
#[derive(Error, Debug)]
pub enum TrainError {
    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The dataset identifier is not recognized.
    #[error("Unknown dataset '{0}' (expected IXI, OASIS or LPBA)")]
    UnknownDataset(String),

    /// Resume index does not select an existing checkpoint.
    #[error("Checkpoint index {index} out of range for {available} checkpoints in {dir:?}")]
    CheckpointIndex { index: i64, available: usize, dir: PathBuf },

    /// A checkpoint bundle is missing or incomplete.
    #[error("Missing checkpoint: {0:?}")]
    MissingCheckpoint(PathBuf),

    /// A validation sample has no segmentations.
    #[error("Validation sample {0} has no label volumes")]
    MissingLabels(usize),

    /// Saving or loading a record failed.
    #[error("Record error: {0}")]
    Recorder(String),

    /// Tensor data could not be read back to the host.
    #[error("Tensor data error: {0}")]
    Data(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Result type for training operations.
pub type Result<T> = std::result::Result<T, TrainError>;

impl TrainError {
    /// Create an invalid configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Wrap a burn recorder error, which only guarantees `Debug`.
    pub fn recorder(err: impl std::fmt::Debug) -> Self {
        Self::Recorder(format!("{:?}", err))
    }

    pub fn data(err: impl std::fmt::Debug) -> Self {
        Self::Data(format!("{:?}", err))
    }
}
