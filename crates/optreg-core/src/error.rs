//! Error types for volume and field operations.

use thiserror::Error;

/// Main error type for core operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Two tensors that must share a grid do not.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A displacement field violates its layout invariant.
    #[error("Invalid displacement field: {0}")]
    InvalidField(String),

    /// A volume is malformed (wrong channel count, empty data, ...).
    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    /// A pair source failed to produce a sample.
    #[error("Data source error: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create an invalid field error.
    pub fn invalid_field(msg: impl Into<String>) -> Self {
        Self::InvalidField(msg.into())
    }

    /// Create an invalid volume error.
    pub fn invalid_volume(msg: impl Into<String>) -> Self {
        Self::InvalidVolume(msg.into())
    }

    /// Wrap an error raised by a data source.
    pub fn source(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Source(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_display() {
        let err = CoreError::ShapeMismatch {
            expected: vec![1, 1, 8, 8, 8],
            actual: vec![1, 1, 8, 8, 4],
        };
        let msg = err.to_string();
        assert!(msg.contains("expected [1, 1, 8, 8, 8]"));
        assert!(msg.contains("got [1, 1, 8, 8, 4]"));
    }

    #[test]
    fn test_source_wraps_message() {
        let err = CoreError::source("file vanished");
        assert_eq!(err.to_string(), "Data source error: file vanished");
    }
}
