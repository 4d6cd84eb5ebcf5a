#![allow(dead_code)]

use burn::tensor::backend::Backend;
use optreg_core::{InMemorySource, PairData, VolumeData, VolumeShape};
use optreg_model::{VoxelMorph, VoxelMorphConfig};

pub const SIZE: usize = 8;

pub fn shape() -> VolumeShape {
    VolumeShape::new(SIZE, SIZE, SIZE)
}

/// Smooth intensities with two label regions split along D.
pub fn sample(phase: f32) -> PairData {
    let image = |offset: f32| {
        VolumeData::from_fn(shape(), move |d, h, w| {
            ((d as f32 + offset) * 0.6).sin() * 0.5 + (h as f32 * 0.4).cos() * 0.3 + w as f32 * 0.05
        })
    };
    let labels = |split: usize| VolumeData::from_fn(shape(), move |d, _, _| if d < split { 1.0 } else { 2.0 });
    PairData::new(image(phase), image(phase + 1.0))
        .unwrap()
        .with_labels(labels(4), labels(5))
        .unwrap()
}

pub fn source(count: usize) -> InMemorySource {
    InMemorySource::new((0..count).map(|i| sample(i as f32 * 0.5)).collect())
}

pub fn tiny_voxelmorph<B: Backend>(device: &B::Device) -> VoxelMorph<B> {
    VoxelMorphConfig::new()
        .with_encoder_features(vec![4, 4])
        .with_decoder_features(vec![4, 4])
        .with_remaining_features(vec![])
        .with_integration_steps(0)
        .init(device)
}
