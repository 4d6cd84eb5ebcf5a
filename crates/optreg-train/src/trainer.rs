//! The epoch loop.

use std::fs;
use std::path::PathBuf;

use burn::{
    config::Config,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::backend::AutodiffBackend,
};
use optreg_core::{collate, ExecutionContext, ImagePair, PairSource};
use optreg_model::{LossComposer, LossValues, Refiner, RegistrationNetwork};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointMeta, CheckpointStore};
use crate::config::TrainingConfig;
use crate::csv_log::{CsvLog, EpochRow};
use crate::dataset::DatasetProfile;
use crate::error::{Result, TrainError};
use crate::evaluator::Evaluator;
use crate::metrics::{AverageMeter, ValidationMetrics};
use crate::observer::{Direction, EpochReport, IterationReport, TrainingObserver};
use crate::schedule::PolynomialDecay;

/// Outcome of [`Trainer::fit`].
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub best_dice: f64,
    pub epochs: Vec<EpochReport>,
}

/// Trains a registration network, optionally distilling per-sample
/// refinements into it.
///
/// With refinement on, every batch is first registered by the network, the
/// detached prediction is refined by a few optimizer steps on the pair
/// itself, and the network is trained to reproduce the refined field. With
/// refinement off the network is trained on image similarity directly.
pub struct Trainer<B, M, O>
where
    B: AutodiffBackend,
    M: RegistrationNetwork<B> + AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    config: TrainingConfig,
    profile: DatasetProfile,
    model: M,
    optimizer: O,
    refiner: Refiner<AdamConfig>,
    composer: LossComposer,
    network_schedule: PolynomialDecay,
    refiner_schedule: PolynomialDecay,
    evaluator: Evaluator,
    store: CheckpointStore,
    observers: Vec<Box<dyn TrainingObserver>>,
    ctx: ExecutionContext<B>,
    best_dice: f64,
}

impl<B, M, O> Trainer<B, M, O>
where
    B: AutodiffBackend,
    M: RegistrationNetwork<B> + AutodiffModule<B>,
    M::InnerModule: RegistrationNetwork<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    /// Validate `config` and, when `epoch_start > 0`, restore the network,
    /// optimizer state and best Dice from the selected checkpoint.
    pub fn new(config: TrainingConfig, model: M, optimizer: O, ctx: ExecutionContext<B>) -> Result<Self> {
        config.validate()?;
        let profile = config.profile();
        let composer = profile.composer();
        let refiner = Refiner::new(config.refiner(), composer, AdamConfig::new())?;

        let store = CheckpointStore::new(config.run_dir());
        let (model, optimizer, best_dice) = if config.epoch_start > 0 {
            resume(&config, &store, model, optimizer, ctx.device())?
        } else {
            (model, optimizer, 0.0)
        };

        Ok(Self {
            network_schedule: PolynomialDecay::new(config.network_lr, config.max_epoch),
            refiner_schedule: PolynomialDecay::new(config.refiner_lr, config.max_epoch),
            evaluator: Evaluator::new(profile.labels.clone()),
            store,
            observers: Vec::new(),
            best_dice,
            config,
            profile,
            model,
            optimizer,
            refiner,
            composer,
            ctx,
        })
    }

    pub fn with_observer(mut self, observer: impl TrainingObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn profile(&self) -> &DatasetProfile {
        &self.profile
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn best_dice(&self) -> f64 {
        self.best_dice
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Network and refiner learning rates for `epoch`.
    pub fn learning_rates(&self, epoch: usize) -> (f64, f64) {
        (self.network_schedule.at(epoch), self.refiner_schedule.at(epoch))
    }

    /// One optimizer step of the network on `pair`.
    pub fn step(&mut self, pair: &ImagePair<B>, lr: f64, refiner_lr: f64) -> Result<LossValues> {
        let output = self.model.register(pair);
        let weights = self.config.network_weights;
        let terms = if self.refiner.is_enabled() {
            let refinement = self.refiner.refine(pair, output.flow.clone().detach(), refiner_lr)?;
            self.composer
                .distillation(&weights, output.flow, refinement.field.into_tensor())
        } else {
            self.composer
                .direct(&weights, output.warped, pair.fixed.clone(), output.flow)
        };
        let values = terms.values("network")?;

        let grads = GradientsParams::from_grads(terms.total.backward(), &self.model);
        self.model = self.optimizer.step(lr, self.model.clone(), grads);
        Ok(values)
    }

    /// Train over every sample of `source` once and return the mean loss.
    pub fn train_epoch(&mut self, source: &dyn PairSource, epoch: usize) -> Result<f64> {
        let (lr, refiner_lr) = self.learning_rates(epoch);
        let mut order: Vec<usize> = (0..source.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64)));

        let batch_size = self.config.batch_size;
        let iterations = order.len().div_ceil(batch_size);
        let mut meter = AverageMeter::new();

        for (iteration, indices) in order.chunks(batch_size).enumerate() {
            let samples = indices
                .par_iter()
                .map(|&index| source.fetch(index))
                .collect::<optreg_core::Result<Vec<_>>>()?;
            let pairs = samples
                .into_iter()
                .map(|sample| sample.into_pair::<B>(self.ctx.device()))
                .collect::<optreg_core::Result<Vec<_>>>()?;
            let batch = collate(pairs)?;

            let mut directions = vec![Direction::Forward];
            if self.profile.bidirectional {
                directions.push(Direction::Reverse);
            }
            for direction in directions {
                let pair = match direction {
                    Direction::Forward => batch.clone(),
                    Direction::Reverse => batch.swapped(),
                };
                let loss = self.step(&pair, lr, refiner_lr)?;
                meter.update(loss.total, pair.numel());

                let report = IterationReport {
                    epoch,
                    max_epoch: self.config.max_epoch,
                    iteration,
                    iterations,
                    direction,
                    loss,
                    learning_rate: lr,
                };
                for observer in &self.observers {
                    observer.on_iteration(&report);
                }
            }
        }
        Ok(meter.avg())
    }

    /// Score the current network on `source` without gradient tracking.
    pub fn validate(&self, source: &dyn PairSource) -> Result<ValidationMetrics> {
        let model = self.model.valid();
        let ctx = ExecutionContext::<B::InnerBackend>::new(self.ctx.device().clone());
        self.evaluator.evaluate(&model, source, &ctx)
    }

    /// Run epochs `epoch_start..max_epoch`, validating and checkpointing
    /// after each one.
    pub fn fit(&mut self, train: &dyn PairSource, val: &dyn PairSource) -> Result<TrainingSummary> {
        match self.run(train, val) {
            Ok(summary) => Ok(summary),
            Err(err) => {
                for observer in &self.observers {
                    observer.on_error(&err);
                }
                Err(err)
            }
        }
    }

    fn run(&mut self, train: &dyn PairSource, val: &dyn PairSource) -> Result<TrainingSummary> {
        if train.is_empty() {
            return Err(TrainError::invalid_config("training source has no samples"));
        }
        let run_dir = self.config.run_dir();
        fs::create_dir_all(&run_dir)?;
        self.config.save(run_dir.join("config.json"))?;
        let log = CsvLog::create(self.config.log_dir().join("log.csv"))?;

        let (epoch_start, max_epoch) = (self.config.epoch_start, self.config.max_epoch);
        info!(
            run = %self.config.run_name(),
            train = train.len(),
            val = val.len(),
            refinement = self.refiner.is_enabled(),
            "starting training"
        );
        for observer in &self.observers {
            observer.on_start(epoch_start, max_epoch);
        }

        let mut epochs = Vec::with_capacity(max_epoch - epoch_start);
        for epoch in epoch_start..max_epoch {
            let loss = self.train_epoch(train, epoch)?;
            let metrics = self.validate(val)?;
            let dice = metrics.mean_dice();
            self.best_dice = self.best_dice.max(dice);

            let meta = CheckpointMeta {
                epoch: epoch + 1,
                best_dice: self.best_dice,
                dice,
                network: self.config.network,
            };
            let checkpoint = self.store.save(&self.model, &self.optimizer, &meta, epoch)?;

            let report = EpochReport {
                epoch,
                max_epoch,
                dice,
                fold_fraction: metrics.mean_fold_fraction(),
                loss,
                learning_rate: self.network_schedule.at(epoch),
                best_dice: self.best_dice,
                checkpoint,
            };
            log.append(&EpochRow::from(&report))?;
            for observer in &self.observers {
                observer.on_epoch(&report);
            }
            epochs.push(report);
            self.ctx.sync();
        }

        Ok(TrainingSummary {
            best_dice: self.best_dice,
            epochs,
        })
    }
}

/// Load the bundle selected by `checkpoint_index` into `model` and `optimizer`.
fn resume<B, M, O>(
    config: &TrainingConfig,
    store: &CheckpointStore,
    model: M,
    optimizer: O,
    device: &B::Device,
) -> Result<(M, O, f64)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let bundle = store.select(config.checkpoint_index)?;
    let meta = store.load_meta(&bundle)?;
    if meta.network != config.network {
        return Err(TrainError::invalid_config(format!(
            "checkpoint {:?} holds a {} network, not {}",
            bundle, meta.network, config.network
        )));
    }
    if meta.epoch != config.epoch_start {
        warn!(
            checkpoint_epoch = meta.epoch,
            epoch_start = config.epoch_start,
            "resuming at an epoch other than the one the checkpoint was saved for"
        );
    }

    let model = store.load_model(&bundle, model, device)?;
    let optimizer = store.load_optimizer(&bundle, optimizer, device)?;
    info!(path = %bundle.display(), best_dice = meta.best_dice, "resumed from checkpoint");
    Ok((model, optimizer, meta.best_dice))
}

impl TrainingSummary {
    pub fn last_checkpoint(&self) -> Option<&PathBuf> {
        self.epochs.last().map(|report| &report.checkpoint)
    }
}
