//! File-backed data loading: NIfTI volumes and the pair sources built on them.

pub mod nifti_io;
pub mod source;

pub use nifti_io::{list_volumes, read_volume, write_volume};
pub use source::{NiftiPairSource, PairFiles};
