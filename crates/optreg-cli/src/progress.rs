use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use optreg_train::{Direction, EpochReport, IterationReport, TrainingObserver};

/// Progress bar over the iterations of the current epoch.
pub struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    pub fn new() -> Result<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );
        Ok(Self { bar })
    }
}

impl TrainingObserver for ProgressObserver {
    fn on_iteration(&self, report: &IterationReport) {
        if report.direction != Direction::Forward {
            return;
        }
        if report.iteration == 0 {
            self.bar.reset();
            self.bar.set_length(report.iterations as u64);
            self.bar
                .set_prefix(format!("epoch {}/{}", report.epoch + 1, report.max_epoch));
        }
        self.bar.set_position(report.iteration as u64 + 1);
        self.bar.set_message(format!("loss {:.5} lr {:.2e}", report.loss.total, report.learning_rate));
    }

    fn on_epoch(&self, report: &EpochReport) {
        self.bar.println(format!(
            "epoch {}: dice {:.4} (best {:.4}), fold fraction {:.6}, loss {:.5}",
            report.epoch, report.dice, report.best_dice, report.fold_fraction, report.loss
        ));
        if report.epoch + 1 == report.max_epoch {
            self.bar.finish_and_clear();
        }
    }
}
