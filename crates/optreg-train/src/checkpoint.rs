//! Per-epoch checkpoint bundles.
//!
//! A bundle is a directory `dsc{dice:.3}_epoch{epoch}` holding the network
//! record, the optimizer record and a `state.json` with the bookkeeping
//! needed to resume. Bundles are listed in natural order of their names.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    module::{AutodiffModule, Module},
    optim::Optimizer,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
};
use optreg_model::NetworkVariant;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TrainError};

const MODEL_FILE: &str = "model";
const OPTIMIZER_FILE: &str = "optimizer";
const STATE_FILE: &str = "state.json";

/// Bookkeeping stored next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// First epoch a resumed run would train.
    pub epoch: usize,
    /// Best validation Dice seen up to and including this epoch.
    pub best_dice: f64,
    /// Validation Dice of this epoch.
    pub dice: f64,
    pub network: NetworkVariant,
}

type BundleRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Directory of checkpoint bundles for one run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn bundle_name(dice: f64, epoch: usize) -> String {
        format!("dsc{:.3}_epoch{}", dice, epoch)
    }

    /// Write the bundle for `epoch` and return its path.
    pub fn save<B, M, O>(&self, model: &M, optimizer: &O, meta: &CheckpointMeta, epoch: usize) -> Result<PathBuf>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let bundle = self.dir.join(Self::bundle_name(meta.dice, epoch));
        fs::create_dir_all(&bundle)?;

        let recorder = BundleRecorder::new();
        model
            .clone()
            .save_file(bundle.join(MODEL_FILE), &recorder)
            .map_err(TrainError::recorder)?;
        Recorder::<B>::record(&recorder, optimizer.to_record(), bundle.join(OPTIMIZER_FILE))
            .map_err(TrainError::recorder)?;
        fs::write(bundle.join(STATE_FILE), serde_json::to_vec_pretty(meta)?)?;

        info!(path = %bundle.display(), "checkpoint saved");
        Ok(bundle)
    }

    /// Bundles in natural order of their names.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut bundles = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.join(STATE_FILE).is_file() {
                bundles.push(path);
            }
        }
        bundles.sort_by(|a, b| natural_cmp(&file_name(a), &file_name(b)));
        Ok(bundles)
    }

    /// Pick a bundle by position; negative indices count from the end.
    pub fn select(&self, index: i64) -> Result<PathBuf> {
        let mut bundles = self.list()?;
        let available = bundles.len();
        let position = if index < 0 { available as i64 + index } else { index };
        if position < 0 || position >= available as i64 {
            return Err(TrainError::CheckpointIndex {
                index,
                available,
                dir: self.dir.clone(),
            });
        }
        Ok(bundles.swap_remove(position as usize))
    }

    pub fn load_meta(&self, bundle: &Path) -> Result<CheckpointMeta> {
        let path = bundle.join(STATE_FILE);
        if !path.is_file() {
            return Err(TrainError::MissingCheckpoint(path));
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    pub fn load_model<B: Backend, M: Module<B>>(&self, bundle: &Path, model: M, device: &B::Device) -> Result<M> {
        model
            .load_file(bundle.join(MODEL_FILE), &BundleRecorder::new(), device)
            .map_err(TrainError::recorder)
    }

    pub fn load_optimizer<B, M, O>(&self, bundle: &Path, optimizer: O, device: &B::Device) -> Result<O>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let record = Recorder::<B>::load(&BundleRecorder::new(), bundle.join(OPTIMIZER_FILE), device)
            .map_err(TrainError::recorder)?;
        Ok(optimizer.load_record(record))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Compare strings treating runs of ASCII digits as numbers, so that
/// `epoch9` sorts before `epoch10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = Chunks::new(a);
    let mut b = Chunks::new(b);
    loop {
        match (a.next(), b.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let order = match (x, y) {
                    (Chunk::Number(x), Chunk::Number(y)) => compare_digits(x, y),
                    (Chunk::Number(_), Chunk::Text(_)) => Ordering::Less,
                    (Chunk::Text(_), Chunk::Number(_)) => Ordering::Greater,
                    (Chunk::Text(x), Chunk::Text(y)) => x.cmp(y),
                };
                if order != Ordering::Equal {
                    return order;
                }
            }
        }
    }
}

fn compare_digits(a: &str, b: &str) -> Ordering {
    let a_trim = a.trim_start_matches('0');
    let b_trim = b.trim_start_matches('0');
    a_trim
        .len()
        .cmp(&b_trim.len())
        .then_with(|| a_trim.cmp(b_trim))
        .then_with(|| a.len().cmp(&b.len()))
}

enum Chunk<'a> {
    Number(&'a str),
    Text(&'a str),
}

struct Chunks<'a> {
    rest: &'a str,
}

impl<'a> Chunks<'a> {
    fn new(s: &'a str) -> Self {
        Self { rest: s }
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Chunk<'a>> {
        let first = self.rest.chars().next()?;
        let digits = first.is_ascii_digit();
        let end = self
            .rest
            .find(|c: char| c.is_ascii_digit() != digits)
            .unwrap_or(self.rest.len());
        let (chunk, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(if digits { Chunk::Number(chunk) } else { Chunk::Text(chunk) })
    }
}
