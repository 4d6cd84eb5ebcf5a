//! The registration network contract and variant selection.

use std::fmt;
use std::str::FromStr;

use burn::{module::Module, tensor::backend::Backend, tensor::Tensor};
use optreg_core::{DisplacementField, ImagePair};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// What a network predicts for a batch of pairs.
#[derive(Debug, Clone)]
pub struct RegistrationOutput<B: Backend> {
    /// Moving image resampled through `flow`, `[N, 1, D, H, W]`.
    pub warped: Tensor<B, 5>,
    /// Displacement field, `[N, 3, D, H, W]`.
    pub flow: Tensor<B, 5>,
}

impl<B: Backend> RegistrationOutput<B> {
    pub fn field(&self) -> Result<DisplacementField<B>> {
        Ok(DisplacementField::new(self.flow.clone())?)
    }
}

/// A learnable deformable registration model.
///
/// Implementations receive `[moving, fixed]` stacked along channels and must
/// return a field on the same grid as the input volumes.
pub trait RegistrationNetwork<B: Backend>: Module<B> {
    fn register(&self, pair: &ImagePair<B>) -> RegistrationOutput<B>;
}

/// Selector for the available architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkVariant {
    TransMorph,
    VoxelMorph,
    ViTVNet,
}

impl NetworkVariant {
    pub const ALL: [NetworkVariant; 3] = [Self::TransMorph, Self::VoxelMorph, Self::ViTVNet];

    pub fn name(&self) -> &'static str {
        match self {
            Self::TransMorph => "TransMorph",
            Self::VoxelMorph => "VoxelMorph",
            Self::ViTVNet => "ViTVNet",
        }
    }
}

impl fmt::Display for NetworkVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NetworkVariant {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|variant| variant.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ModelError::UnknownNetwork(s.to_string()))
    }
}
