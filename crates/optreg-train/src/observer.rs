//! Progress reporting hooks for the training loop.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use optreg_model::LossValues;
use tracing::{error, info};

use crate::error::TrainError;

/// Which way a pair was registered in a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Moving onto fixed.
    Forward,
    /// Fixed onto moving, taken on bidirectional datasets.
    Reverse,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub epoch: usize,
    pub max_epoch: usize,
    pub iteration: usize,
    pub iterations: usize,
    pub direction: Direction,
    pub loss: LossValues,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub max_epoch: usize,
    pub dice: f64,
    pub fold_fraction: f64,
    /// Mean training loss over the epoch.
    pub loss: f64,
    pub learning_rate: f64,
    pub best_dice: f64,
    pub checkpoint: PathBuf,
}

/// Receives training events. Every hook defaults to a no-op.
pub trait TrainingObserver: Send + Sync {
    fn on_start(&self, _epoch_start: usize, _max_epoch: usize) {}

    fn on_iteration(&self, _report: &IterationReport) {}

    fn on_epoch(&self, _report: &EpochReport) {}

    fn on_error(&self, _error: &TrainError) {}
}

/// Logs progress through `tracing`.
#[derive(Debug, Clone)]
pub struct ConsoleObserver {
    log_interval: usize,
}

impl ConsoleObserver {
    pub fn new(log_interval: usize) -> Self {
        Self {
            log_interval: log_interval.max(1),
        }
    }
}

impl Default for ConsoleObserver {
    fn default() -> Self {
        Self::new(1)
    }
}

impl TrainingObserver for ConsoleObserver {
    fn on_start(&self, epoch_start: usize, max_epoch: usize) {
        info!(epoch_start, max_epoch, "training started");
    }

    fn on_iteration(&self, report: &IterationReport) {
        if report.iteration % self.log_interval != 0 && report.iteration + 1 != report.iterations {
            return;
        }
        info!(
            epoch = report.epoch,
            iteration = report.iteration,
            iterations = report.iterations,
            direction = ?report.direction,
            loss = report.loss.total,
            primary = report.loss.primary,
            regularization = report.loss.regularization,
            lr = report.learning_rate,
            "train"
        );
    }

    fn on_epoch(&self, report: &EpochReport) {
        info!(
            epoch = report.epoch,
            max_epoch = report.max_epoch,
            dice = report.dice,
            fold_fraction = report.fold_fraction,
            loss = report.loss,
            best_dice = report.best_dice,
            "epoch finished"
        );
    }

    fn on_error(&self, err: &TrainError) {
        error!(error = %err, "training failed");
    }
}

/// Keeps every report in memory.
#[derive(Debug, Clone, Default)]
pub struct HistoryObserver {
    iterations: Arc<Mutex<Vec<IterationReport>>>,
    epochs: Arc<Mutex<Vec<EpochReport>>>,
}

impl HistoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iterations(&self) -> Vec<IterationReport> {
        self.iterations.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn epochs(&self) -> Vec<EpochReport> {
        self.epochs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl TrainingObserver for HistoryObserver {
    fn on_iteration(&self, report: &IterationReport) {
        self.iterations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
    }

    fn on_epoch(&self, report: &EpochReport) {
        self.epochs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
    }
}
