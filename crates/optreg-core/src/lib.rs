//! Core data model for deformable 3-D registration.
//!
//! Volumes are burn tensors laid out as `[N, C, D, H, W]`. Displacement
//! fields use the same layout with three channels holding per-voxel offsets
//! (in voxels) along D, H and W.

pub mod error;
pub mod context;
pub mod volume;
pub mod source;
pub mod field;
pub mod interpolation;
pub mod warp;

pub use context::ExecutionContext;
pub use error::{CoreError, Result};
pub use field::DisplacementField;
pub use source::{collate, InMemorySource, PairSource};
pub use volume::{ImagePair, PairData, VolumeData, VolumeShape};
pub use warp::{warp, Interpolation, SpatialTransformer};
