//! Dense displacement fields and deformation analysis.
//!
//! A field is a `[N, 3, D, H, W]` tensor: channel `i` holds the offset, in
//! voxels, along spatial axis `i` (D, H, W). The transform it describes maps
//! `x` to `x + u(x)`.

use burn::tensor::{backend::Backend, ElementConversion, Int, Tensor};
use nalgebra::{Matrix3, Vector3};

use crate::error::{CoreError, Result};
use crate::volume::VolumeShape;

/// Dense displacement field over an image grid.
#[derive(Debug, Clone)]
pub struct DisplacementField<B: Backend> {
    tensor: Tensor<B, 5>,
}

impl<B: Backend> DisplacementField<B> {
    /// Wrap a `[N, 3, D, H, W]` tensor.
    pub fn new(tensor: Tensor<B, 5>) -> Result<Self> {
        let [_, channels, _, _, _] = tensor.dims();
        if channels != 3 {
            return Err(CoreError::invalid_field(format!(
                "expected 3 displacement components, got {}",
                channels
            )));
        }
        Ok(Self { tensor })
    }

    /// The identity transform.
    pub fn zeros(batch: usize, shape: VolumeShape, device: &B::Device) -> Self {
        Self {
            tensor: Tensor::zeros([batch, 3, shape.depth, shape.height, shape.width], device),
        }
    }

    /// Field of the affine map `x -> A x + t` in voxel coordinates,
    /// i.e. `u(x) = (A - I) x + t`.
    pub fn affine(
        batch: usize,
        shape: VolumeShape,
        matrix: &Matrix3<f64>,
        translation: &Vector3<f64>,
        device: &B::Device,
    ) -> Self {
        let [d, h, w] = shape.dims();
        let axis = |len: usize, view: [usize; 5]| {
            Tensor::<B, 1, Int>::arange(0..len as i64, device)
                .float()
                .reshape(view)
                .expand([batch, 1, d, h, w])
        };
        let coords = [
            axis(d, [1, 1, d, 1, 1]),
            axis(h, [1, 1, 1, h, 1]),
            axis(w, [1, 1, 1, 1, w]),
        ];
        let linear = matrix - Matrix3::identity();

        let components = (0..3)
            .map(|i| {
                let mut component = Tensor::<B, 5>::full([batch, 1, d, h, w], translation[i], device);
                for (j, coord) in coords.iter().enumerate() {
                    let coefficient = linear[(i, j)];
                    if coefficient != 0.0 {
                        component = component + coord.clone().mul_scalar(coefficient);
                    }
                }
                component
            })
            .collect();

        Self {
            tensor: Tensor::cat(components, 1),
        }
    }

    pub fn tensor(&self) -> &Tensor<B, 5> {
        &self.tensor
    }

    pub fn into_tensor(self) -> Tensor<B, 5> {
        self.tensor
    }

    pub fn batch_size(&self) -> usize {
        self.tensor.dims()[0]
    }

    pub fn shape(&self) -> VolumeShape {
        VolumeShape::of(&self.tensor)
    }

    /// Fails unless `volume` has the same batch size and spatial grid.
    pub fn ensure_matches(&self, volume: &Tensor<B, 5>) -> Result<()> {
        let [n, _, d, h, w] = self.tensor.dims();
        let [vn, _, vd, vh, vw] = volume.dims();
        if [n, d, h, w] != [vn, vd, vh, vw] {
            return Err(CoreError::ShapeMismatch {
                expected: vec![n, d, h, w],
                actual: vec![vn, vd, vh, vw],
            });
        }
        Ok(())
    }

    /// Cut the field out of any autodiff graph.
    pub fn detach(self) -> Self {
        Self {
            tensor: self.tensor.detach(),
        }
    }

    /// Jacobian determinant of `x -> x + u(x)` at every voxel, `[N, D, H, W]`.
    ///
    /// Derivatives use central differences in the interior and one-sided
    /// differences on the border.
    pub fn jacobian_determinant(&self) -> Tensor<B, 4> {
        let [n, _, d, h, w] = self.tensor.dims();
        let component = |i: usize| self.tensor.clone().slice([0..n, i..i + 1, 0..d, 0..h, 0..w]);

        // j[i][k] = d(x_i + u_i) / dx_k
        let j: Vec<Vec<Tensor<B, 5>>> = (0..3)
            .map(|i| {
                let u = component(i);
                (0..3)
                    .map(|k| {
                        let grad = gradient_along(u.clone(), k + 2);
                        if i == k {
                            grad.add_scalar(1.0)
                        } else {
                            grad
                        }
                    })
                    .collect()
            })
            .collect();

        let minor = |a: usize, b: usize, c: usize, e: usize| {
            j[1][a].clone() * j[2][b].clone() - j[1][c].clone() * j[2][e].clone()
        };
        let det = j[0][0].clone() * minor(1, 2, 2, 1) - j[0][1].clone() * minor(0, 2, 2, 0)
            + j[0][2].clone() * minor(0, 1, 1, 0);

        det.reshape([n, d, h, w])
    }

    /// Fraction of voxels whose Jacobian determinant is not positive.
    pub fn fold_fraction(&self) -> f64 {
        let det = self.jacobian_determinant();
        let total = det.shape().num_elements();
        if total == 0 {
            return 0.0;
        }
        let folded = det.lower_equal_elem(0.0).int().sum().into_scalar().elem::<i64>();
        folded as f64 / total as f64
    }
}

/// Finite-difference derivative along `axis` of a 5-D tensor, same shape out.
///
/// Axes of length 1 have no defined derivative and yield zeros.
pub fn gradient_along<B: Backend>(tensor: Tensor<B, 5>, axis: usize) -> Tensor<B, 5> {
    let len = tensor.dims()[axis];
    if len < 2 {
        return tensor.zeros_like();
    }

    let first = tensor.clone().narrow(axis, 1, 1) - tensor.clone().narrow(axis, 0, 1);
    let last = tensor.clone().narrow(axis, len - 1, 1) - tensor.clone().narrow(axis, len - 2, 1);
    if len == 2 {
        return Tensor::cat(vec![first, last], axis);
    }

    let interior = (tensor.clone().narrow(axis, 2, len - 2) - tensor.narrow(axis, 0, len - 2)).div_scalar(2.0);
    Tensor::cat(vec![first, interior, last], axis)
}
