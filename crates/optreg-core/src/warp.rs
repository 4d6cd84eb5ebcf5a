//! Resampling volumes through displacement fields.

use std::marker::PhantomData;

use burn::{
    module::Module,
    tensor::{backend::Backend, Int, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::field::DisplacementField;
use crate::interpolation::{nearest, trilinear};

/// How voxel values are read between grid points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    /// Intensities.
    #[default]
    Trilinear,
    /// Label maps.
    Nearest,
}

/// Absolute sampling positions `x + u(x)` for a `[N, 3, D, H, W]` displacement.
///
/// The identity grid is built per axis and broadcast, so no full-size
/// coordinate tensor is allocated for it.
pub fn sampling_grid<B: Backend>(flow: Tensor<B, 5>) -> Tensor<B, 5> {
    let [n, _, d, h, w] = flow.dims();
    let device = flow.device();

    let axis = |len: usize, shape: [usize; 5]| {
        Tensor::<B, 1, Int>::arange(0..len as i64, &device)
            .float()
            .reshape(shape)
    };

    let flow_d = flow.clone().slice([0..n, 0..1, 0..d, 0..h, 0..w]) + axis(d, [1, 1, d, 1, 1]);
    let flow_h = flow.clone().slice([0..n, 1..2, 0..d, 0..h, 0..w]) + axis(h, [1, 1, 1, h, 1]);
    let flow_w = flow.slice([0..n, 2..3, 0..d, 0..h, 0..w]) + axis(w, [1, 1, 1, 1, w]);

    Tensor::cat(vec![flow_d, flow_h, flow_w], 1)
}

/// Warp `volume` so that `out(x) = volume(x + u(x))`.
///
/// Fails if the field grid differs from the volume grid or the batch sizes
/// disagree. Out-of-range sample positions read the border voxel.
pub fn warp<B: Backend>(
    volume: Tensor<B, 5>,
    field: &DisplacementField<B>,
    mode: Interpolation,
) -> Result<Tensor<B, 5>> {
    field.ensure_matches(&volume)?;
    let grid = sampling_grid(field.tensor().clone());
    Ok(match mode {
        Interpolation::Trilinear => trilinear(volume, grid),
        Interpolation::Nearest => nearest(volume, grid),
    })
}

/// Parameter-free warping layer for use inside networks.
///
/// Takes raw flow tensors so that it composes with layers that have not
/// produced a validated [`DisplacementField`] yet, such as velocity
/// integration.
#[derive(Module, Debug)]
pub struct SpatialTransformer<B: Backend> {
    phantom: PhantomData<B>,
}

impl<B: Backend> SpatialTransformer<B> {
    pub fn new() -> Self {
        Self { phantom: PhantomData }
    }

    /// `image`: `[N, C, D, H, W]`, `flow`: `[N, 3, D, H, W]`.
    pub fn forward(&self, image: Tensor<B, 5>, flow: Tensor<B, 5>) -> Tensor<B, 5> {
        trilinear(image, sampling_grid(flow))
    }
}

impl<B: Backend> Default for SpatialTransformer<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::volume::VolumeShape;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn ramp(shape: VolumeShape) -> Tensor<B, 5> {
        let values: Vec<f32> = (0..shape.voxel_count()).map(|v| v as f32).collect();
        Tensor::from_data(
            TensorData::new(values, [1, 1, shape.depth, shape.height, shape.width]),
            &Default::default(),
        )
    }

    #[test]
    fn test_zero_field_is_identity() {
        let shape = VolumeShape::new(3, 4, 5);
        let volume = ramp(shape);
        let field = DisplacementField::<B>::zeros(1, shape, &Default::default());
        for mode in [Interpolation::Trilinear, Interpolation::Nearest] {
            let warped = warp(volume.clone(), &field, mode).unwrap();
            let diff: f32 = (warped - volume.clone()).abs().max().into_scalar();
            assert!(diff < 1e-6);
        }
    }

    #[test]
    fn test_integer_shift_along_width() {
        let shape = VolumeShape::new(2, 2, 4);
        let device = Default::default();
        let volume = ramp(shape);
        let shift = Tensor::<B, 5>::cat(
            vec![
                Tensor::zeros([1, 2, 2, 2, 4], &device),
                Tensor::ones([1, 1, 2, 2, 4], &device),
            ],
            1,
        );
        let field = DisplacementField::new(shift).unwrap();
        let warped = warp(volume, &field, Interpolation::Trilinear).unwrap();
        let data = warped.into_data().to_vec::<f32>().unwrap();
        // out(w) = in(w + 1); the last column clamps to the border.
        assert_eq!(&data[0..4], &[1.0, 2.0, 3.0, 3.0]);
    }

    #[test]
    fn test_field_grid_must_match_volume() {
        let device = Default::default();
        let volume = ramp(VolumeShape::new(2, 2, 4));
        let field = DisplacementField::<B>::zeros(1, VolumeShape::new(2, 2, 2), &device);
        let err = warp(volume, &field, Interpolation::Nearest).unwrap_err();
        assert!(matches!(err, CoreError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_transformer_matches_free_function() {
        let shape = VolumeShape::new(3, 3, 3);
        let device = Default::default();
        let volume = ramp(shape);
        let flow = Tensor::<B, 5>::full([1, 3, 3, 3, 3], 0.25, &device);
        let field = DisplacementField::new(flow.clone()).unwrap();

        let a = SpatialTransformer::new().forward(volume.clone(), flow);
        let b = warp(volume, &field, Interpolation::Trilinear).unwrap();
        let diff: f32 = (a - b).abs().max().into_scalar();
        assert_eq!(diff, 0.0);
    }
}
