//! Per-sample refinement of a predicted displacement field.
//!
//! The refiner treats the field itself as the only trainable parameter and
//! runs a short gradient descent on the sample's similarity + smoothness
//! objective. Its parameter and optimizer are created inside
//! [`Refiner::refine`] and dropped before it returns.

use burn::{
    module::{Module, Param},
    optim::{adaptor::OptimizerAdaptor, Adam, AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use optreg_core::{DisplacementField, ImagePair, SpatialTransformer};
use tracing::debug;

use crate::losses::{LossComposer, LossValues, LossWeights};

/// A displacement field exposed as a module parameter, with the warp that
/// consumes it.
#[derive(Module, Debug)]
pub struct FieldParameter<B: Backend> {
    flow: Param<Tensor<B, 5>>,
    stn: SpatialTransformer<B>,
}

impl<B: Backend> FieldParameter<B> {
    /// Starts from `initial` with its gradient history removed.
    pub fn new(initial: Tensor<B, 5>) -> Self {
        Self {
            flow: Param::from_tensor(initial.detach()),
            stn: SpatialTransformer::new(),
        }
    }

    pub fn flow(&self) -> Tensor<B, 5> {
        self.flow.val()
    }

    /// Warp `moving` through the current field; returns `(warped, flow)`.
    pub fn forward(&self, moving: Tensor<B, 5>) -> (Tensor<B, 5>, Tensor<B, 5>) {
        let flow = self.flow.val();
        (self.stn.forward(moving, flow.clone()), flow)
    }
}

/// Builds the disposable optimizer bound to one [`FieldParameter`].
pub trait RefinerOptimizerFactory<B: AutodiffBackend> {
    type Optimizer: Optimizer<FieldParameter<B>, B>;

    fn create(&self) -> Self::Optimizer;
}

impl<B: AutodiffBackend> RefinerOptimizerFactory<B> for AdamConfig {
    type Optimizer = OptimizerAdaptor<Adam, FieldParameter<B>, B>;

    fn create(&self) -> Self::Optimizer {
        self.init()
    }
}

#[derive(Config, Debug)]
pub struct RefinerConfig {
    /// Inner gradient steps per sample; 0 disables refinement.
    #[config(default = 10)]
    pub iterations: usize,
    #[config(default = "LossWeights { similarity: 1.0, regularization: 1.0 }")]
    pub weights: LossWeights,
}

/// Result of refining one sample. Tensors are detached.
#[derive(Debug, Clone)]
pub struct Refinement<B: Backend> {
    pub warped: Tensor<B, 5>,
    pub field: DisplacementField<B>,
    /// Optimizer steps taken.
    pub steps: usize,
    /// Objective before each step.
    pub losses: Vec<LossValues>,
}

/// Test-time optimizer for single predictions.
#[derive(Debug, Clone)]
pub struct Refiner<F> {
    config: RefinerConfig,
    composer: LossComposer,
    factory: F,
}

impl<F> Refiner<F> {
    pub fn new(config: RefinerConfig, composer: LossComposer, factory: F) -> crate::error::Result<Self> {
        config.weights.validate()?;
        Ok(Self {
            config,
            composer,
            factory,
        })
    }

    pub fn config(&self) -> &RefinerConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.iterations > 0
    }

    /// Improve `initial` for this one pair with learning rate `lr`.
    ///
    /// With zero iterations no optimizer is created and the result is
    /// `initial` warped once.
    pub fn refine<B>(
        &self,
        pair: &ImagePair<B>,
        initial: Tensor<B, 5>,
        lr: f64,
    ) -> crate::error::Result<Refinement<B>>
    where
        B: AutodiffBackend,
        F: RefinerOptimizerFactory<B>,
    {
        DisplacementField::new(initial.clone())?.ensure_matches(&pair.moving)?;

        let mut parameter = FieldParameter::new(initial);
        let mut losses: Vec<LossValues> = Vec::with_capacity(self.config.iterations);

        if self.is_enabled() {
            let mut optimizer = self.factory.create();
            for step in 0..self.config.iterations {
                let (warped, flow) = parameter.forward(pair.moving.clone());
                let terms = self
                    .composer
                    .direct(&self.config.weights, warped, pair.fixed.clone(), flow);
                let values = terms.values("refiner")?;

                if let Some(previous) = losses.last() {
                    if values.total > previous.total {
                        debug!(step, previous = previous.total, current = values.total, "refiner loss increased");
                    }
                }
                debug!(
                    step,
                    loss = values.total,
                    similarity = values.primary,
                    regularization = values.regularization,
                    "refiner iteration"
                );
                losses.push(values);

                let grads = GradientsParams::from_grads(terms.total.backward(), &parameter);
                parameter = optimizer.step(lr, parameter, grads);
            }
        }

        let (warped, flow) = parameter.forward(pair.moving.clone());
        Ok(Refinement {
            warped: warped.detach(),
            field: DisplacementField::new(flow.detach())?,
            steps: losses.len(),
            losses,
        })
    }
}
