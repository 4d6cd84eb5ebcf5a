//! Similarity, smoothness and consistency losses, and their composition.

use burn::tensor::{
    backend::Backend,
    module::conv3d,
    ops::ConvOptions,
    ElementConversion, Tensor,
};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Local normalized cross-correlation over cubic windows.
///
/// Window statistics come from a box-filter convolution with zero padding.
/// The loss is `-mean(cc)`, so identical images score close to `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalNcc {
    pub window: usize,
    pub epsilon: f32,
}

impl Default for LocalNcc {
    fn default() -> Self {
        Self {
            window: 9,
            epsilon: 1e-5,
        }
    }
}

impl LocalNcc {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            ..Self::default()
        }
    }

    /// `target`, `warped`: single-channel `[N, 1, D, H, W]`.
    pub fn forward<B: Backend>(&self, target: Tensor<B, 5>, warped: Tensor<B, 5>) -> Tensor<B, 1> {
        let k = self.window;
        let pad = k / 2;
        let kernel = Tensor::<B, 5>::ones([1, 1, k, k, k], &target.device());
        let options = ConvOptions::new([1, 1, 1], [pad, pad, pad], [1, 1, 1], 1);
        let window_sum = |x: Tensor<B, 5>| conv3d(x, kernel.clone(), None, options.clone());
        let size = (k * k * k) as f32;

        let i_sum = window_sum(target.clone());
        let j_sum = window_sum(warped.clone());
        let i2_sum = window_sum(target.clone() * target.clone());
        let j2_sum = window_sum(warped.clone() * warped.clone());
        let ij_sum = window_sum(target * warped);

        let u_i = i_sum.clone() / size;
        let u_j = j_sum.clone() / size;

        let cross = ij_sum - u_j.clone() * i_sum.clone() - u_i.clone() * j_sum.clone() + u_i.clone() * u_j.clone() * size;
        let i_var = i2_sum - u_i.clone() * i_sum * 2.0 + u_i.clone() * u_i * size;
        let j_var = j2_sum - u_j.clone() * j_sum * 2.0 + u_j.clone() * u_j * size;

        let cc = cross.clone() * cross / (i_var * j_var + self.epsilon);
        cc.mean().neg()
    }
}

/// Normalized cross-correlation over the whole volume.
pub fn global_ncc<B: Backend>(target: Tensor<B, 5>, warped: Tensor<B, 5>, epsilon: f32) -> Tensor<B, 1> {
    let i_hat = target.clone() - target.mean().reshape([1, 1, 1, 1, 1]);
    let j_hat = warped.clone() - warped.mean().reshape([1, 1, 1, 1, 1]);

    let num = (i_hat.clone() * j_hat.clone()).mean();
    let den = (i_hat.powf_scalar(2.0).mean() * j_hat.powf_scalar(2.0).mean() + epsilon).sqrt();
    (num / den).neg()
}

/// Mean squared error between two tensors of equal shape.
pub fn mse<B: Backend>(a: Tensor<B, 5>, b: Tensor<B, 5>) -> Tensor<B, 1> {
    (a - b).powf_scalar(2.0).mean()
}

/// Image similarity term. Lower is more similar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Similarity {
    LocalNcc(LocalNcc),
    GlobalNcc,
    Mse,
}

impl Default for Similarity {
    fn default() -> Self {
        Self::LocalNcc(LocalNcc::default())
    }
}

impl Similarity {
    pub fn forward<B: Backend>(&self, warped: Tensor<B, 5>, target: Tensor<B, 5>) -> Tensor<B, 1> {
        match self {
            Self::LocalNcc(ncc) => ncc.forward(target, warped),
            Self::GlobalNcc => global_ncc(target, warped, 1e-5),
            Self::Mse => mse(warped, target),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Penalty {
    L1,
    #[default]
    L2,
}

/// Smoothness penalty on forward differences of a `[N, 3, D, H, W]` field.
///
/// The result is the mean of the three per-axis penalties. Axes of length 1
/// contribute nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GradLoss {
    pub penalty: Penalty,
}

impl GradLoss {
    pub fn new(penalty: Penalty) -> Self {
        Self { penalty }
    }

    pub fn forward<B: Backend>(&self, flow: Tensor<B, 5>) -> Tensor<B, 1> {
        let dims = flow.dims();
        let mut total = Tensor::<B, 1>::zeros([1], &flow.device());
        for axis in 2..5 {
            let len = dims[axis];
            if len < 2 {
                continue;
            }
            let diff = flow.clone().narrow(axis, 1, len - 1) - flow.clone().narrow(axis, 0, len - 1);
            let diff = match self.penalty {
                Penalty::L1 => diff.abs(),
                Penalty::L2 => diff.powf_scalar(2.0),
            };
            total = total + diff.mean();
        }
        total / 3.0
    }
}

/// `(similarity, regularization)` weights of a composed loss.
///
/// In distillation the first weight scales the consistency term instead.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    pub similarity: f64,
    pub regularization: f64,
}

impl LossWeights {
    pub fn new(similarity: f64, regularization: f64) -> Result<Self> {
        let weights = Self {
            similarity,
            regularization,
        };
        weights.validate()?;
        Ok(weights)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("similarity", self.similarity), ("regularization", self.regularization)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ModelError::invalid_weights(format!(
                    "{} weight must be finite and non-negative, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of a composed loss: the differentiable total and its weighted parts.
#[derive(Debug, Clone)]
pub struct LossTerms<B: Backend> {
    pub total: Tensor<B, 1>,
    /// Weighted similarity (direct) or consistency (distillation) term.
    pub primary: Tensor<B, 1>,
    /// Weighted smoothness term; `None` when its weight is zero.
    pub regularization: Option<Tensor<B, 1>>,
}

/// Host-side copy of [`LossTerms`] for logging and averaging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossValues {
    pub total: f64,
    pub primary: f64,
    pub regularization: f64,
}

impl<B: Backend> LossTerms<B> {
    /// Read the terms back, failing if the total is NaN or infinite.
    pub fn values(&self, stage: &'static str) -> Result<LossValues> {
        let scalar = |t: &Tensor<B, 1>| t.clone().into_scalar().elem::<f64>();
        let values = LossValues {
            total: scalar(&self.total),
            primary: scalar(&self.primary),
            regularization: self.regularization.as_ref().map(scalar).unwrap_or(0.0),
        };
        if !values.total.is_finite() {
            return Err(ModelError::NonFiniteLoss {
                stage,
                value: values.total,
            });
        }
        Ok(values)
    }
}

/// Builds the weighted objectives used by the network and the refiner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossComposer {
    pub similarity: Similarity,
    pub regularization: GradLoss,
}

impl LossComposer {
    pub fn new(similarity: Similarity, regularization: GradLoss) -> Self {
        Self {
            similarity,
            regularization,
        }
    }

    pub fn similarity<B: Backend>(&self, warped: Tensor<B, 5>, target: Tensor<B, 5>) -> Tensor<B, 1> {
        self.similarity.forward(warped, target)
    }

    pub fn regularization<B: Backend>(&self, flow: Tensor<B, 5>) -> Tensor<B, 1> {
        self.regularization.forward(flow)
    }

    pub fn consistency<B: Backend>(&self, flow: Tensor<B, 5>, refined: Tensor<B, 5>) -> Tensor<B, 1> {
        mse(flow, refined)
    }

    /// `w_sim * similarity(warped, target) + w_reg * grad(flow)`.
    pub fn direct<B: Backend>(
        &self,
        weights: &LossWeights,
        warped: Tensor<B, 5>,
        target: Tensor<B, 5>,
        flow: Tensor<B, 5>,
    ) -> LossTerms<B> {
        let primary = self.similarity(warped, target) * weights.similarity;
        self.with_regularization(weights, primary, flow)
    }

    /// `w_sim * mse(flow, refined) + w_reg * grad(flow)`.
    ///
    /// `refined` is expected to carry no gradient history.
    pub fn distillation<B: Backend>(
        &self,
        weights: &LossWeights,
        flow: Tensor<B, 5>,
        refined: Tensor<B, 5>,
    ) -> LossTerms<B> {
        let primary = self.consistency(flow.clone(), refined) * weights.similarity;
        self.with_regularization(weights, primary, flow)
    }

    fn with_regularization<B: Backend>(&self, weights: &LossWeights, primary: Tensor<B, 1>, flow: Tensor<B, 5>) -> LossTerms<B> {
        if weights.regularization == 0.0 {
            return LossTerms {
                total: primary.clone(),
                primary,
                regularization: None,
            };
        }
        let regularization = self.regularization(flow) * weights.regularization;
        LossTerms {
            total: primary.clone() + regularization.clone(),
            primary,
            regularization: Some(regularization),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{Distribution, TensorData};
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn scalar(t: Tensor<B, 1>) -> f32 {
        t.into_scalar()
    }

    #[test]
    fn test_local_ncc_identical_images() {
        let device = Default::default();
        let image = Tensor::<B, 5>::random([1, 1, 8, 8, 8], Distribution::Uniform(0.0, 1.0), &device);
        let loss = scalar(LocalNcc::new(3).forward(image.clone(), image));
        assert!(loss < -0.95, "loss {}", loss);
    }

    #[test]
    fn test_local_ncc_prefers_aligned() {
        let device = Default::default();
        let image = Tensor::<B, 5>::random([1, 1, 8, 8, 8], Distribution::Uniform(0.0, 1.0), &device);
        let other = Tensor::<B, 5>::random([1, 1, 8, 8, 8], Distribution::Uniform(0.0, 1.0), &device);
        let ncc = LocalNcc::new(3);
        assert!(scalar(ncc.forward(image.clone(), image.clone())) < scalar(ncc.forward(image, other)));
    }

    #[test]
    fn test_global_ncc_and_mse() {
        let device = Default::default();
        let values: Vec<f32> = (0..27).map(|v| v as f32).collect();
        let image = Tensor::<B, 5>::from_data(TensorData::new(values, [1, 1, 3, 3, 3]), &device);
        let loss = scalar(global_ncc(image.clone(), image.clone() * 2.0 + 1.0, 1e-5));
        assert!((loss + 1.0).abs() < 1e-4);
        assert_eq!(scalar(mse(image.clone(), image.clone())), 0.0);
        assert!((scalar(mse(image.clone(), image + 2.0)) - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_grad_loss_constant_and_ramp() {
        let device = Default::default();
        let constant = Tensor::<B, 5>::full([1, 3, 4, 4, 4], 3.0, &device);
        assert_eq!(scalar(GradLoss::default().forward(constant)), 0.0);

        // Unit slope along W only: one axis of penalty 1, averaged over three.
        let ramp = Tensor::<B, 1, burn::tensor::Int>::arange(0..4, &device)
            .float()
            .reshape([1, 1, 1, 1, 4])
            .expand([1, 3, 4, 4, 4]);
        let l2 = scalar(GradLoss::new(Penalty::L2).forward(ramp.clone()));
        let l1 = scalar(GradLoss::new(Penalty::L1).forward(ramp * 2.0));
        assert!((l2 - 1.0 / 3.0).abs() < 1e-6);
        assert!((l1 - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_weights_validation() {
        assert!(LossWeights::new(1.0, 0.02).is_ok());
        assert!(LossWeights::new(1.0, 0.0).is_ok());
        assert!(matches!(LossWeights::new(-1.0, 0.02), Err(ModelError::InvalidWeights(_))));
        assert!(LossWeights::new(1.0, f64::NAN).is_err());
    }

    #[test]
    fn test_zero_regularization_weight_skips_term() {
        let device = Default::default();
        let composer = LossComposer::default();
        let flow = Tensor::<B, 5>::random([1, 3, 4, 4, 4], Distribution::Default, &device);
        let refined = Tensor::<B, 5>::zeros([1, 3, 4, 4, 4], &device);

        let terms = composer.distillation(&LossWeights::new(1.0, 0.0).unwrap(), flow.clone(), refined.clone());
        assert!(terms.regularization.is_none());
        let values = terms.values("network").unwrap();
        assert_eq!(values.total, values.primary);

        let terms = composer.distillation(&LossWeights::new(2.0, 0.5).unwrap(), flow.clone(), refined.clone());
        let values = terms.values("network").unwrap();
        let expected = 2.0 * scalar(mse(flow.clone(), refined)) as f64 + 0.5 * scalar(GradLoss::default().forward(flow)) as f64;
        assert!((values.total - expected).abs() < 1e-5);
    }

    #[test]
    fn test_non_finite_total_is_reported() {
        let device = Default::default();
        let terms = LossTerms::<B> {
            total: Tensor::from_data(TensorData::new(vec![f32::NAN], [1]), &device),
            primary: Tensor::zeros([1], &device),
            regularization: None,
        };
        assert!(matches!(terms.values("refiner"), Err(ModelError::NonFiniteLoss { stage: "refiner", .. })));
    }
}
