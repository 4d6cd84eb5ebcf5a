//! Per-run CSV log with one row per epoch.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Result;
use crate::observer::EpochReport;

/// One line of `log.csv`. Field order is the column order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochRow {
    pub epoch: usize,
    pub dice: f64,
    pub fold_fraction: f64,
    pub loss: f64,
    pub learning_rate: f64,
}

impl From<&EpochReport> for EpochRow {
    fn from(report: &EpochReport) -> Self {
        Self {
            epoch: report.epoch,
            dice: report.dice,
            fold_fraction: report.fold_fraction,
            loss: report.loss,
            learning_rate: report.learning_rate,
        }
    }
}

/// Appends [`EpochRow`]s to a CSV file, keeping rows from earlier runs.
#[derive(Debug, Clone)]
pub struct CsvLog {
    path: PathBuf,
}

impl CsvLog {
    /// Prepare `path` for appending. The header is written with the first
    /// row of an empty file.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, row: &EpochRow) -> Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let empty = file.metadata()?.len() == 0;
        let mut writer = csv::WriterBuilder::new().has_headers(empty).from_writer(file);
        writer.serialize(row)?;
        writer.flush()?;
        Ok(())
    }
}
