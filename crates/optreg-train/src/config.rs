//! Options of a training run, stored as `config.json` next to its checkpoints.

use std::path::PathBuf;

use burn::config::Config;
use optreg_model::{LossWeights, NetworkVariant, RefinerConfig};

use crate::dataset::{DatasetId, DatasetProfile};
use crate::error::TrainError;

/// Every option of a training run.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub dataset: DatasetId,
    pub network: NetworkVariant,
    #[config(default = 1)]
    pub batch_size: usize,
    #[config(default = "PathBuf::from(\"data/Train\")")]
    pub train_dir: PathBuf,
    #[config(default = "PathBuf::from(\"data/Val\")")]
    pub val_dir: PathBuf,
    /// Segmentation directory for datasets that keep labels apart from images.
    #[config(default = "None")]
    pub label_dir: Option<PathBuf>,
    /// Atlas image for atlas-paired datasets.
    #[config(default = "None")]
    pub atlas_path: Option<PathBuf>,
    #[config(default = "None")]
    pub atlas_labels: Option<PathBuf>,
    /// Replaces the dataset's scored label set.
    #[config(default = "None")]
    pub labels: Option<Vec<u32>>,
    #[config(default = 1e-4)]
    pub network_lr: f64,
    #[config(default = 0.1)]
    pub refiner_lr: f64,
    /// 0 starts fresh; anything else resumes from a checkpoint.
    #[config(default = 0)]
    pub epoch_start: usize,
    #[config(default = 500)]
    pub max_epoch: usize,
    /// Inner refiner steps per sample; 0 trains the network directly.
    #[config(default = 10)]
    pub refiner_iterations: usize,
    #[config(default = "LossWeights { similarity: 1.0, regularization: 0.02 }")]
    pub network_weights: LossWeights,
    #[config(default = "LossWeights { similarity: 1.0, regularization: 1.0 }")]
    pub refiner_weights: LossWeights,
    /// Index into the naturally sorted checkpoint list; negative counts from the end.
    #[config(default = "-1")]
    pub checkpoint_index: i64,
    #[config(default = "PathBuf::from(\"checkpoints\")")]
    pub checkpoint_root: PathBuf,
    #[config(default = "PathBuf::from(\"logs\")")]
    pub log_root: PathBuf,
    /// Seed for the per-epoch shuffle of training samples.
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    /// Reject settings the run cannot start with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.max_epoch == 0 {
            return Err(TrainError::invalid_config("max_epoch must be positive"));
        }
        if self.epoch_start >= self.max_epoch {
            return Err(TrainError::invalid_config(format!(
                "epoch_start {} must be below max_epoch {}",
                self.epoch_start, self.max_epoch
            )));
        }
        if self.batch_size == 0 {
            return Err(TrainError::invalid_config("batch_size must be positive"));
        }
        if !(self.network_lr.is_finite() && self.network_lr > 0.0) {
            return Err(TrainError::invalid_config(format!(
                "network_lr must be positive, got {}",
                self.network_lr
            )));
        }
        if self.refinement_enabled() && !(self.refiner_lr.is_finite() && self.refiner_lr > 0.0) {
            return Err(TrainError::invalid_config(format!(
                "refiner_lr must be positive when refinement is enabled, got {}",
                self.refiner_lr
            )));
        }
        self.network_weights.validate()?;
        self.refiner_weights.validate()?;
        if matches!(&self.labels, Some(labels) if labels.is_empty()) {
            return Err(TrainError::invalid_config("label override must not be empty"));
        }
        Ok(())
    }

    pub fn refinement_enabled(&self) -> bool {
        self.refiner_iterations > 0
    }

    /// `{network}_{dataset}`, suffixed with `_opt` when refinement is on.
    pub fn run_name(&self) -> String {
        format!(
            "{}_{}{}",
            self.network,
            self.dataset,
            if self.refinement_enabled() { "_opt" } else { "" }
        )
    }

    pub fn run_dir(&self) -> PathBuf {
        self.checkpoint_root.join(self.run_name())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_root.join(self.run_name())
    }

    pub fn profile(&self) -> DatasetProfile {
        let profile = DatasetProfile::for_id(self.dataset);
        match &self.labels {
            Some(labels) => profile.with_labels(labels.clone()),
            None => profile,
        }
    }

    pub fn refiner(&self) -> RefinerConfig {
        RefinerConfig::new()
            .with_iterations(self.refiner_iterations)
            .with_weights(self.refiner_weights)
    }
}
