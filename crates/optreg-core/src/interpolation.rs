//! Grid sampling of `[N, C, D, H, W]` volumes.
//!
//! Both samplers take an absolute sampling grid `[N, 3, D, H, W]` in voxel
//! coordinates ordered (d, h, w). Coordinates outside the volume are clamped
//! to the border voxel.

use burn::tensor::{backend::Backend, Int, Tensor};

/// Gathers voxels of a flattened volume at linear indices shaped like the grid.
struct VoxelGather<B: Backend> {
    flat: Tensor<B, 3>,
    dims: [usize; 5],
}

impl<B: Backend> VoxelGather<B> {
    fn new(volume: Tensor<B, 5>) -> Self {
        let dims = volume.dims();
        let [n, c, d, h, w] = dims;
        Self {
            flat: volume.reshape([n, c, d * h * w]),
            dims,
        }
    }

    /// Linear voxel index from clamped integer coordinates.
    fn index(&self, z: Tensor<B, 5, Int>, y: Tensor<B, 5, Int>, x: Tensor<B, 5, Int>) -> Tensor<B, 5, Int> {
        let [_, _, _, h, w] = self.dims;
        z.mul_scalar((h * w) as i32) + y.mul_scalar(w as i32) + x
    }

    fn at(&self, index: Tensor<B, 5, Int>) -> Tensor<B, 5> {
        let [n, c, d, h, w] = self.dims;
        let index = index.reshape([n, 1, d * h * w]).repeat(&[1, c, 1]);
        self.flat.clone().gather(2, index).reshape([n, c, d, h, w])
    }
}

fn split_grid<B: Backend>(grid: Tensor<B, 5>) -> [Tensor<B, 5>; 3] {
    let [n, _, d, h, w] = grid.dims();
    [
        grid.clone().slice([0..n, 0..1, 0..d, 0..h, 0..w]),
        grid.clone().slice([0..n, 1..2, 0..d, 0..h, 0..w]),
        grid.slice([0..n, 2..3, 0..d, 0..h, 0..w]),
    ]
}

/// NaN coordinates read voxel 0; the NaN still reaches the result through the weights.
fn clamp_index<B: Backend>(coord: Tensor<B, 5>, size: usize) -> Tensor<B, 5, Int> {
    let nan = coord.clone().is_nan();
    coord.mask_fill(nan, 0.0).clamp(0.0, (size - 1) as f32).int()
}

/// Trilinear interpolation, differentiable with respect to both inputs.
pub fn trilinear<B: Backend>(volume: Tensor<B, 5>, grid: Tensor<B, 5>) -> Tensor<B, 5> {
    let [_, _, d, h, w] = volume.dims();
    let [z, y, x] = split_grid(grid);

    let z0 = z.clone().floor();
    let y0 = y.clone().floor();
    let x0 = x.clone().floor();

    // Weights come from the unclamped coordinates; only the lookups are clamped.
    let wz1 = z - z0.clone();
    let wy1 = y - y0.clone();
    let wx1 = x - x0.clone();
    let wz0 = wz1.clone().neg().add_scalar(1.0);
    let wy0 = wy1.clone().neg().add_scalar(1.0);
    let wx0 = wx1.clone().neg().add_scalar(1.0);

    let z1 = clamp_index(z0.clone().add_scalar(1.0), d);
    let y1 = clamp_index(y0.clone().add_scalar(1.0), h);
    let x1 = clamp_index(x0.clone().add_scalar(1.0), w);
    let z0 = clamp_index(z0, d);
    let y0 = clamp_index(y0, h);
    let x0 = clamp_index(x0, w);

    let voxels = VoxelGather::new(volume);
    let corner = |zi: &Tensor<B, 5, Int>, yi: &Tensor<B, 5, Int>, xi: &Tensor<B, 5, Int>| {
        voxels.at(voxels.index(zi.clone(), yi.clone(), xi.clone()))
    };

    let c00 = corner(&z0, &y0, &x0) * wx0.clone() + corner(&z0, &y0, &x1) * wx1.clone();
    let c01 = corner(&z0, &y1, &x0) * wx0.clone() + corner(&z0, &y1, &x1) * wx1.clone();
    let c10 = corner(&z1, &y0, &x0) * wx0.clone() + corner(&z1, &y0, &x1) * wx1.clone();
    let c11 = corner(&z1, &y1, &x0) * wx0 + corner(&z1, &y1, &x1) * wx1;

    let c0 = c00 * wy0.clone() + c01 * wy1.clone();
    let c1 = c10 * wy0 + c11 * wy1;

    c0 * wz0 + c1 * wz1
}

/// Nearest-neighbour interpolation. Never produces values absent from the input.
pub fn nearest<B: Backend>(volume: Tensor<B, 5>, grid: Tensor<B, 5>) -> Tensor<B, 5> {
    let [_, _, d, h, w] = volume.dims();
    let [z, y, x] = split_grid(grid);

    let zi = clamp_index(z.round(), d);
    let yi = clamp_index(y.round(), h);
    let xi = clamp_index(x.round(), w);

    let voxels = VoxelGather::new(volume);
    voxels.at(voxels.index(zi, yi, xi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn ramp(device: &<B as Backend>::Device) -> Tensor<B, 5> {
        let values: Vec<f32> = (0..4 * 4 * 4).map(|v| v as f32).collect();
        Tensor::from_data(TensorData::new(values, [1, 1, 4, 4, 4]), device)
    }

    fn identity_grid(device: &<B as Backend>::Device, offset: [f32; 3]) -> Tensor<B, 5> {
        let axis = |len: usize, shape: [usize; 5], off: f32| {
            Tensor::<B, 1, Int>::arange(0..len as i64, device)
                .float()
                .add_scalar(off)
                .reshape(shape)
                .expand([1, 1, 4, 4, 4])
        };
        Tensor::cat(
            vec![
                axis(4, [1, 1, 4, 1, 1], offset[0]),
                axis(4, [1, 1, 1, 4, 1], offset[1]),
                axis(4, [1, 1, 1, 1, 4], offset[2]),
            ],
            1,
        )
    }

    #[test]
    fn test_trilinear_identity_is_exact() {
        let device = Default::default();
        let volume = ramp(&device);
        let sampled = trilinear(volume.clone(), identity_grid(&device, [0.0; 3]));
        let diff: f32 = (sampled - volume).abs().max().into_scalar();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_trilinear_half_voxel_average() {
        let device = Default::default();
        let volume = ramp(&device);
        // Half a voxel along W averages neighbours: value + 0.5 away from the border.
        let sampled = trilinear(volume, identity_grid(&device, [0.0, 0.0, 0.5]));
        let data = sampled.into_data().to_vec::<f32>().unwrap();
        assert!((data[0] - 0.5).abs() < 1e-6);
        assert!((data[1] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_out_of_bounds_clamps_to_border() {
        let device = Default::default();
        let volume = ramp(&device);
        let sampled = trilinear(volume.clone(), identity_grid(&device, [0.0, 0.0, -10.0]));
        let data = sampled.into_data().to_vec::<f32>().unwrap();
        // Every sample along W collapses onto w = 0.
        assert_eq!(data[0], 0.0);
        assert_eq!(data[3], 0.0);
        assert_eq!(data[4], 4.0);

        let sampled = nearest(volume, identity_grid(&device, [10.0, 0.0, 0.0]));
        let data = sampled.into_data().to_vec::<f32>().unwrap();
        assert_eq!(data[0], 48.0);
    }

    #[test]
    fn test_nearest_keeps_label_values() {
        let device = Default::default();
        let labels = Tensor::<B, 5>::from_data(
            TensorData::new((0..64).map(|v| (v % 3) as f32 * 10.0).collect::<Vec<f32>>(), [1, 1, 4, 4, 4]),
            &device,
        );
        let sampled = nearest(labels, identity_grid(&device, [0.3, -0.4, 0.45]));
        for value in sampled.into_data().to_vec::<f32>().unwrap() {
            assert!(value == 0.0 || value == 10.0 || value == 20.0);
        }
    }

    #[test]
    fn test_nan_coordinates_propagate_without_panicking() {
        let device = Default::default();
        let grid = Tensor::<B, 5>::full([1, 3, 4, 4, 4], f32::NAN, &device);
        let sampled = trilinear(ramp(&device), grid.clone());
        assert!(sampled.into_data().to_vec::<f32>().unwrap().iter().all(|v| v.is_nan()));

        let sampled = nearest(ramp(&device), grid);
        assert_eq!(sampled.into_data().to_vec::<f32>().unwrap()[0], 0.0);
    }
}
