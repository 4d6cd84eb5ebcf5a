//! Training orchestration for deformable registration.
//!
//! The [`Trainer`] drives the epoch loop: polynomial learning-rate decay,
//! optional per-sample refinement distilled back into the network,
//! bidirectional steps for symmetric datasets, validation with Dice and fold
//! fraction, and one checkpoint bundle per epoch.

pub mod error;
pub mod dataset;
pub mod config;
pub mod schedule;
pub mod checkpoint;
pub mod metrics;
pub mod evaluator;
pub mod observer;
pub mod csv_log;
pub mod trainer;

pub use checkpoint::{natural_cmp, CheckpointMeta, CheckpointStore};
pub use config::TrainingConfig;
pub use csv_log::{CsvLog, EpochRow};
pub use dataset::{DatasetId, DatasetProfile, Pairing};
pub use error::{Result, TrainError};
pub use evaluator::{Evaluator, SampleScore};
pub use metrics::{dice_per_label, mean_dice, AverageMeter, ValidationMetrics};
pub use observer::{
    ConsoleObserver, Direction, EpochReport, HistoryObserver, IterationReport, TrainingObserver,
};
pub use schedule::PolynomialDecay;
pub use trainer::{Trainer, TrainingSummary};
