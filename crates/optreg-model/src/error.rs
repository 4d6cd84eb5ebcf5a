//! Error types for networks, losses and refinement.

use optreg_core::CoreError;
use thiserror::Error;

/// Main error type for model operations.
#[derive(Error, Debug)]
pub enum ModelError {
    /// Loss weights must be finite and non-negative.
    #[error("Invalid loss weights: {0}")]
    InvalidWeights(String),

    /// A loss evaluated to NaN or infinity.
    #[error("Non-finite {stage} loss: {value}")]
    NonFiniteLoss { stage: &'static str, value: f64 },

    /// The network variant identifier is not recognized.
    #[error("Unknown network variant '{0}' (expected TransMorph, VoxelMorph or ViTVNet)")]
    UnknownNetwork(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

impl ModelError {
    /// Create an invalid weights error.
    pub fn invalid_weights(msg: impl Into<String>) -> Self {
        Self::InvalidWeights(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_finite_display() {
        let err = ModelError::NonFiniteLoss {
            stage: "refiner",
            value: f64::NAN,
        };
        assert_eq!(err.to_string(), "Non-finite refiner loss: NaN");
    }

    #[test]
    fn test_core_error_converts() {
        let err: ModelError = CoreError::invalid_field("two channels").into();
        assert!(matches!(err, ModelError::Core(CoreError::InvalidField(_))));
    }
}
