//! Integration of stationary velocity fields into displacements.

use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use optreg_core::SpatialTransformer;

/// Scaling-and-squaring integration of a stationary velocity field.
///
/// The velocity is scaled by `1 / 2^steps` and then composed with itself
/// `steps` times: `u <- u + u(x + u)`. The result is a displacement whose
/// transform is diffeomorphic for smooth enough velocities.
#[derive(Module, Debug)]
pub struct VecInt<B: Backend> {
    stn: SpatialTransformer<B>,
    steps: usize,
}

impl<B: Backend> VecInt<B> {
    pub fn new(steps: usize) -> Self {
        Self {
            stn: SpatialTransformer::new(),
            steps,
        }
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// `velocity`: `[N, 3, D, H, W]`.
    pub fn forward(&self, velocity: Tensor<B, 5>) -> Tensor<B, 5> {
        let scale = 1.0 / 2f32.powi(self.steps as i32);
        let mut flow = velocity * scale;
        for _ in 0..self.steps {
            let composed = self.stn.forward(flow.clone(), flow.clone());
            flow = flow + composed;
        }
        flow
    }
}
