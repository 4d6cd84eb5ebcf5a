//! Sample sources and batch collation.

use burn::tensor::{backend::Backend, Tensor};

use crate::error::{CoreError, Result};
use crate::volume::{ImagePair, PairData};

/// A random-access collection of registration samples.
///
/// `fetch` produces host-side data only, so implementations may be called
/// from worker threads while the device is busy with the previous batch.
pub trait PairSource: Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fetch(&self, index: usize) -> Result<PairData>;
}

/// Pair source over samples already held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    pairs: Vec<PairData>,
}

impl InMemorySource {
    pub fn new(pairs: Vec<PairData>) -> Self {
        Self { pairs }
    }

    pub fn push(&mut self, pair: PairData) {
        self.pairs.push(pair);
    }
}

impl PairSource for InMemorySource {
    fn len(&self) -> usize {
        self.pairs.len()
    }

    fn fetch(&self, index: usize) -> Result<PairData> {
        self.pairs.get(index).cloned().ok_or_else(|| {
            CoreError::source(format!("sample index {} out of range for {} samples", index, self.pairs.len()))
        })
    }
}

/// Concatenate single samples along the batch axis.
///
/// Labels are kept only if every sample carries them.
pub fn collate<B: Backend>(pairs: Vec<ImagePair<B>>) -> Result<ImagePair<B>> {
    let first = pairs
        .first()
        .ok_or_else(|| CoreError::invalid_volume("cannot collate an empty batch"))?;
    if pairs.len() == 1 {
        return Ok(first.clone());
    }

    let reference = first.fixed.dims();
    for pair in pairs.iter().skip(1) {
        let [_, c, d, h, w] = pair.fixed.dims();
        if [c, d, h, w] != [reference[1], reference[2], reference[3], reference[4]] {
            return Err(CoreError::ShapeMismatch {
                expected: reference.to_vec(),
                actual: pair.fixed.dims().to_vec(),
            });
        }
    }

    let labelled = pairs.iter().all(|p| p.fixed_labels.is_some() && p.moving_labels.is_some());
    let mut fixed = Vec::with_capacity(pairs.len());
    let mut moving = Vec::with_capacity(pairs.len());
    let mut fixed_labels = Vec::new();
    let mut moving_labels = Vec::new();
    for pair in pairs {
        fixed.push(pair.fixed);
        moving.push(pair.moving);
        if labelled {
            fixed_labels.extend(pair.fixed_labels);
            moving_labels.extend(pair.moving_labels);
        }
    }

    let batch = ImagePair::new(Tensor::cat(fixed, 0), Tensor::cat(moving, 0))?;
    if labelled {
        batch.with_labels(Tensor::cat(fixed_labels, 0), Tensor::cat(moving_labels, 0))
    } else {
        Ok(batch)
    }
}
