//! Registration networks, the loss composer and the per-sample refiner.
//!
//! Every network implements [`RegistrationNetwork`]: it consumes a fixed /
//! moving pair and returns the moving image warped by its own predicted
//! displacement field together with that field.

pub mod error;
pub mod network;
pub mod blocks;
pub mod integration;
pub mod losses;
pub mod refiner;
pub mod transmorph;
pub mod voxelmorph;
pub mod vitvnet;

pub use error::{ModelError, Result};
pub use integration::VecInt;
pub use losses::{GradLoss, LocalNcc, LossComposer, LossTerms, LossValues, LossWeights, Penalty, Similarity};
pub use network::{NetworkVariant, RegistrationNetwork, RegistrationOutput};
pub use refiner::{FieldParameter, Refinement, Refiner, RefinerConfig, RefinerOptimizerFactory};
pub use transmorph::{TransMorph, TransMorphConfig};
pub use vitvnet::{ViTVNet, ViTVNetConfig};
pub use voxelmorph::{VoxelMorph, VoxelMorphConfig};
