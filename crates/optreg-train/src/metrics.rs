//! Validation metrics and running averages.

/// Running average weighted by sample count.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AverageMeter {
    pub val: f64,
    pub sum: f64,
    pub count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` as the mean of `n` samples.
    pub fn update(&mut self, value: f64, n: usize) {
        self.val = value;
        self.sum += value * n as f64;
        self.count += n;
    }

    /// Weighted mean so far, 0 before the first update.
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Dice overlap of each label between two label volumes.
///
/// Inputs hold integral label ids stored as floats, both in the same voxel
/// order. A label absent from both volumes scores 1.
pub fn dice_per_label(warped: &[f32], fixed: &[f32], labels: &[u32]) -> Vec<f64> {
    labels
        .iter()
        .map(|&label| {
            let target = label as f32;
            let mut in_warped = 0usize;
            let mut in_fixed = 0usize;
            let mut overlap = 0usize;
            for (&a, &b) in warped.iter().zip(fixed) {
                let a = a.round() == target;
                let b = b.round() == target;
                in_warped += a as usize;
                in_fixed += b as usize;
                overlap += (a && b) as usize;
            }
            let denominator = in_warped + in_fixed;
            if denominator == 0 {
                1.0
            } else {
                2.0 * overlap as f64 / denominator as f64
            }
        })
        .collect()
}

/// Dice averaged over `labels`.
pub fn mean_dice(warped: &[f32], fixed: &[f32], labels: &[u32]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let scores = dice_per_label(warped, fixed, labels);
    scores.iter().sum::<f64>() / scores.len() as f64
}

/// Per-epoch validation averages.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ValidationMetrics {
    pub dice: AverageMeter,
    pub fold: AverageMeter,
}

impl ValidationMetrics {
    pub fn update(&mut self, dice: f64, fold_fraction: f64, n: usize) {
        self.dice.update(dice, n);
        self.fold.update(fold_fraction, n);
    }

    pub fn mean_dice(&self) -> f64 {
        self.dice.avg()
    }

    pub fn mean_fold_fraction(&self) -> f64 {
        self.fold.avg()
    }

    pub fn samples(&self) -> usize {
        self.dice.count
    }
}
