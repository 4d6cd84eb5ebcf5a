//! Image volumes and fixed/moving pairs.
//!
//! Host-side samples ([`VolumeData`], [`PairData`]) are plain `Vec<f32>`
//! buffers so that data loading can happen on worker threads. They are
//! uploaded to the device as [`ImagePair`] right before use.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Spatial extent of a volume, `[D, H, W]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeShape {
    pub depth: usize,
    pub height: usize,
    pub width: usize,
}

impl VolumeShape {
    pub const fn new(depth: usize, height: usize, width: usize) -> Self {
        Self {
            depth,
            height,
            width,
        }
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.depth, self.height, self.width]
    }

    pub fn voxel_count(&self) -> usize {
        self.depth * self.height * self.width
    }

    /// Spatial shape of a `[N, C, D, H, W]` tensor.
    pub fn of<B: Backend>(tensor: &Tensor<B, 5>) -> Self {
        let [_, _, d, h, w] = tensor.dims();
        Self::new(d, h, w)
    }
}

impl From<[usize; 3]> for VolumeShape {
    fn from(dims: [usize; 3]) -> Self {
        Self::new(dims[0], dims[1], dims[2])
    }
}

impl std::fmt::Display for VolumeShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.depth, self.height, self.width)
    }
}

/// A single-channel volume held in host memory, row-major `[D, H, W]`.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeData {
    shape: VolumeShape,
    values: Vec<f32>,
}

impl VolumeData {
    pub fn new(shape: VolumeShape, values: Vec<f32>) -> Result<Self> {
        if values.len() != shape.voxel_count() {
            return Err(CoreError::invalid_volume(format!(
                "{} values do not fill a {} grid ({} voxels)",
                values.len(),
                shape,
                shape.voxel_count()
            )));
        }
        Ok(Self { shape, values })
    }

    /// Build a volume by evaluating `f(d, h, w)` at every voxel.
    pub fn from_fn(shape: VolumeShape, mut f: impl FnMut(usize, usize, usize) -> f32) -> Self {
        let mut values = Vec::with_capacity(shape.voxel_count());
        for d in 0..shape.depth {
            for h in 0..shape.height {
                for w in 0..shape.width {
                    values.push(f(d, h, w));
                }
            }
        }
        Self { shape, values }
    }

    pub fn shape(&self) -> VolumeShape {
        self.shape
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Upload as a `[1, 1, D, H, W]` tensor.
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 5> {
        let data = TensorData::new(self.values.clone(), [1, 1, self.shape.depth, self.shape.height, self.shape.width]);
        Tensor::from_data(data, device)
    }
}

/// Host-side fixed/moving sample with optional segmentations.
#[derive(Debug, Clone)]
pub struct PairData {
    pub fixed: VolumeData,
    pub moving: VolumeData,
    pub fixed_labels: Option<VolumeData>,
    pub moving_labels: Option<VolumeData>,
}

impl PairData {
    pub fn new(fixed: VolumeData, moving: VolumeData) -> Result<Self> {
        if fixed.shape() != moving.shape() {
            return Err(CoreError::ShapeMismatch {
                expected: fixed.shape().dims().to_vec(),
                actual: moving.shape().dims().to_vec(),
            });
        }
        Ok(Self {
            fixed,
            moving,
            fixed_labels: None,
            moving_labels: None,
        })
    }

    pub fn with_labels(mut self, fixed_labels: VolumeData, moving_labels: VolumeData) -> Result<Self> {
        for labels in [&fixed_labels, &moving_labels] {
            if labels.shape() != self.fixed.shape() {
                return Err(CoreError::ShapeMismatch {
                    expected: self.fixed.shape().dims().to_vec(),
                    actual: labels.shape().dims().to_vec(),
                });
            }
        }
        self.fixed_labels = Some(fixed_labels);
        self.moving_labels = Some(moving_labels);
        Ok(self)
    }

    pub fn shape(&self) -> VolumeShape {
        self.fixed.shape()
    }

    /// Exchange the fixed and moving roles, labels included.
    pub fn swapped(self) -> Self {
        Self {
            fixed: self.moving,
            moving: self.fixed,
            fixed_labels: self.moving_labels,
            moving_labels: self.fixed_labels,
        }
    }

    pub fn into_pair<B: Backend>(self, device: &B::Device) -> Result<ImagePair<B>> {
        let pair = ImagePair::new(self.fixed.to_tensor(device), self.moving.to_tensor(device))?;
        match (self.fixed_labels, self.moving_labels) {
            (Some(fixed), Some(moving)) => pair.with_labels(fixed.to_tensor(device), moving.to_tensor(device)),
            _ => Ok(pair),
        }
    }
}

/// Fixed and moving volumes on the device, `[N, 1, D, H, W]` each.
///
/// Label volumes hold integral label ids stored as floats so that they can
/// go through the same resampling path as intensities.
#[derive(Debug, Clone)]
pub struct ImagePair<B: Backend> {
    pub fixed: Tensor<B, 5>,
    pub moving: Tensor<B, 5>,
    pub fixed_labels: Option<Tensor<B, 5>>,
    pub moving_labels: Option<Tensor<B, 5>>,
}

impl<B: Backend> ImagePair<B> {
    pub fn new(fixed: Tensor<B, 5>, moving: Tensor<B, 5>) -> Result<Self> {
        let [_, channels, _, _, _] = fixed.dims();
        if channels != 1 {
            return Err(CoreError::invalid_volume(format!(
                "expected single-channel volumes, got {} channels",
                channels
            )));
        }
        if fixed.dims() != moving.dims() {
            return Err(CoreError::ShapeMismatch {
                expected: fixed.dims().to_vec(),
                actual: moving.dims().to_vec(),
            });
        }
        Ok(Self {
            fixed,
            moving,
            fixed_labels: None,
            moving_labels: None,
        })
    }

    pub fn with_labels(mut self, fixed_labels: Tensor<B, 5>, moving_labels: Tensor<B, 5>) -> Result<Self> {
        for labels in [&fixed_labels, &moving_labels] {
            if labels.dims() != self.fixed.dims() {
                return Err(CoreError::ShapeMismatch {
                    expected: self.fixed.dims().to_vec(),
                    actual: labels.dims().to_vec(),
                });
            }
        }
        self.fixed_labels = Some(fixed_labels);
        self.moving_labels = Some(moving_labels);
        Ok(self)
    }

    pub fn batch_size(&self) -> usize {
        self.fixed.dims()[0]
    }

    pub fn shape(&self) -> VolumeShape {
        VolumeShape::of(&self.fixed)
    }

    /// Number of scalars in the fixed batch.
    pub fn numel(&self) -> usize {
        self.fixed.shape().num_elements()
    }

    /// Network input: moving and fixed stacked along channels, `[N, 2, D, H, W]`.
    pub fn network_input(&self) -> Tensor<B, 5> {
        Tensor::cat(vec![self.moving.clone(), self.fixed.clone()], 1)
    }

    /// Exchange the fixed and moving roles, labels included.
    pub fn swapped(&self) -> Self {
        Self {
            fixed: self.moving.clone(),
            moving: self.fixed.clone(),
            fixed_labels: self.moving_labels.clone(),
            moving_labels: self.fixed_labels.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn test_volume_data_rejects_wrong_length() {
        let shape = VolumeShape::new(2, 2, 2);
        assert!(VolumeData::new(shape, vec![0.0; 7]).is_err());
        assert!(VolumeData::new(shape, vec![0.0; 8]).is_ok());
    }

    #[test]
    fn test_from_fn_is_row_major() {
        let volume = VolumeData::from_fn(VolumeShape::new(2, 3, 4), |d, h, w| (d * 100 + h * 10 + w) as f32);
        assert_eq!(volume.values()[0], 0.0);
        assert_eq!(volume.values()[1], 1.0);
        assert_eq!(volume.values()[4], 10.0);
        assert_eq!(volume.values()[12], 100.0);
    }

    #[test]
    fn test_pair_shape_mismatch() {
        let device = Default::default();
        let fixed = Tensor::<B, 5>::zeros([1, 1, 4, 4, 4], &device);
        let moving = Tensor::<B, 5>::zeros([1, 1, 4, 4, 2], &device);
        let err = ImagePair::new(fixed, moving).unwrap_err();
        assert!(matches!(err, CoreError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_pair_rejects_multichannel() {
        let device = Default::default();
        let fixed = Tensor::<B, 5>::zeros([1, 2, 4, 4, 4], &device);
        let moving = Tensor::<B, 5>::zeros([1, 2, 4, 4, 4], &device);
        assert!(matches!(ImagePair::new(fixed, moving), Err(CoreError::InvalidVolume(_))));
    }

    #[test]
    fn test_network_input_order_and_swap() {
        let device = Default::default();
        let fixed = Tensor::<B, 5>::zeros([1, 1, 2, 2, 2], &device);
        let moving = Tensor::<B, 5>::ones([1, 1, 2, 2, 2], &device);
        let pair = ImagePair::new(fixed, moving).unwrap();

        let input = pair.network_input();
        assert_eq!(input.dims(), [1, 2, 2, 2, 2]);
        let first: f32 = input.clone().slice([0..1, 0..1, 0..2, 0..2, 0..2]).sum().into_scalar();
        assert_eq!(first, 8.0);

        let swapped = pair.swapped();
        let moving_sum: f32 = swapped.moving.sum().into_scalar();
        assert_eq!(moving_sum, 0.0);
    }

    #[test]
    fn test_pair_data_upload_keeps_labels() {
        let shape = VolumeShape::new(2, 2, 2);
        let data = PairData::new(
            VolumeData::from_fn(shape, |_, _, _| 1.0),
            VolumeData::from_fn(shape, |_, _, _| 2.0),
        )
        .unwrap()
        .with_labels(
            VolumeData::from_fn(shape, |d, _, _| d as f32),
            VolumeData::from_fn(shape, |_, h, _| h as f32),
        )
        .unwrap();

        let pair = data.swapped().into_pair::<B>(&Default::default()).unwrap();
        assert_eq!(pair.fixed.dims(), [1, 1, 2, 2, 2]);
        let fixed_sum: f32 = pair.fixed.sum().into_scalar();
        assert_eq!(fixed_sum, 16.0);
        assert!(pair.fixed_labels.is_some());
        assert!(pair.moving_labels.is_some());
    }
}
