//! Validation scoring: label overlap after warping and field regularity.

use burn::prelude::*;
use optreg_core::{warp, DisplacementField, ExecutionContext, ImagePair, Interpolation, PairSource};
use optreg_model::RegistrationNetwork;
use tracing::debug;

use crate::error::{Result, TrainError};
use crate::metrics::{mean_dice, ValidationMetrics};

/// Scores of one validation sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleScore {
    pub dice: f64,
    pub fold_fraction: f64,
}

/// Computes Dice and fold fraction for predicted fields.
#[derive(Debug, Clone)]
pub struct Evaluator {
    labels: Vec<u32>,
}

impl Evaluator {
    pub fn new(labels: Vec<u32>) -> Self {
        Self { labels }
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// Score every sample of a batch.
    ///
    /// Moving labels are resampled with nearest-neighbour lookup so that no
    /// new label ids appear.
    pub fn score_batch<B: Backend>(&self, pair: &ImagePair<B>, field: &DisplacementField<B>) -> Result<Vec<SampleScore>> {
        let (fixed_labels, moving_labels) = match (&pair.fixed_labels, &pair.moving_labels) {
            (Some(fixed), Some(moving)) => (fixed.clone(), moving.clone()),
            _ => return Err(TrainError::MissingLabels(0)),
        };
        let warped = warp(moving_labels, field, Interpolation::Nearest)?;

        let [batch, _, d, h, w] = warped.dims();
        let mut scores = Vec::with_capacity(batch);
        for i in 0..batch {
            let warped_i = host_values(warped.clone().slice([i..i + 1, 0..1, 0..d, 0..h, 0..w]))?;
            let fixed_i = host_values(fixed_labels.clone().slice([i..i + 1, 0..1, 0..d, 0..h, 0..w]))?;
            let flow_i = field.tensor().clone().slice([i..i + 1, 0..3, 0..d, 0..h, 0..w]);
            scores.push(SampleScore {
                dice: mean_dice(&warped_i, &fixed_i, &self.labels),
                fold_fraction: DisplacementField::new(flow_i)?.fold_fraction(),
            });
        }
        Ok(scores)
    }

    /// Run `model` over every sample of `source`, one at a time.
    pub fn evaluate<B, M>(&self, model: &M, source: &dyn PairSource, ctx: &ExecutionContext<B>) -> Result<ValidationMetrics>
    where
        B: Backend,
        M: RegistrationNetwork<B>,
    {
        let mut metrics = ValidationMetrics::default();
        for index in 0..source.len() {
            let pair = source.fetch(index)?.into_pair::<B>(ctx.device())?;
            if pair.fixed_labels.is_none() || pair.moving_labels.is_none() {
                return Err(TrainError::MissingLabels(index));
            }
            let output = model.register(&pair);
            let field = output.field()?;
            for score in self.score_batch(&pair, &field)? {
                metrics.update(score.dice, score.fold_fraction, 1);
            }
            debug!(
                index,
                dice = metrics.dice.val,
                fold_fraction = metrics.fold.val,
                "validation sample"
            );
        }
        Ok(metrics)
    }
}

fn host_values<B: Backend>(tensor: Tensor<B, 5>) -> Result<Vec<f32>> {
    tensor.into_data().convert::<f32>().to_vec::<f32>().map_err(TrainError::data)
}
