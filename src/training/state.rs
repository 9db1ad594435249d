//! Training state: best-accuracy tracking, early stopping and the epoch history.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::utils::error::Result;

/// Header of the per-run training log
pub const CSV_HEADER: &str =
    "epoch,train_loss,train_accuracy,val_loss,val_accuracy,val_top5,learning_rate";

/// Metrics for a single epoch (1-based `epoch`)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub val_top5: f64,
    pub learning_rate: f64,
}

impl EpochMetrics {
    pub fn csv_row(&self) -> String {
        format!(
            "{},{:.6},{:.6},{:.6},{:.6},{:.6},{:e}",
            self.epoch,
            self.train_loss,
            self.train_accuracy,
            self.val_loss,
            self.val_accuracy,
            self.val_top5,
            self.learning_rate
        )
    }

    /// Append this row to a CSV log, writing the header first if the file is new
    pub fn append_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let is_new = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if is_new {
            writeln!(file, "{}", CSV_HEADER)?;
        }
        writeln!(file, "{}", self.csv_row())?;
        Ok(())
    }
}

/// Training state for checkpointing and resumption
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    /// Completed epochs
    pub epoch: usize,
    pub best_accuracy: f64,
    pub best_epoch: Option<usize>,
    pub patience_counter: usize,
    pub history: Vec<EpochMetrics>,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            epoch: 0,
            best_accuracy: 0.0,
            best_epoch: None,
            patience_counter: 0,
            history: Vec::new(),
        }
    }
}

/// Outcome of recording an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochVerdict {
    /// Validation accuracy strictly beat the best so far
    Improved,
    /// No improvement; the patience counter was incremented
    Stalled { patience_counter: usize },
}

/// Tracks best accuracy and the early-stopping counter
#[derive(Debug, Clone)]
pub struct Trainer {
    early_stopping_patience: usize,
    state: TrainingState,
}

impl Trainer {
    pub fn new(early_stopping_patience: usize) -> Self {
        Self {
            early_stopping_patience,
            state: TrainingState::default(),
        }
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Resume from a checkpoint that recorded `epoch` completed epochs
    pub fn resume_from(&mut self, epoch: usize, best_accuracy: f64) {
        self.state.epoch = epoch;
        self.state.best_accuracy = best_accuracy;
        self.state.best_epoch = Some(epoch);
        self.state.patience_counter = 0;
    }

    /// Record an epoch. Only a strict increase in validation accuracy counts
    /// as an improvement; ties increment the patience counter.
    pub fn update_epoch(&mut self, metrics: EpochMetrics) -> EpochVerdict {
        self.state.epoch = metrics.epoch;
        self.state.history.push(metrics);

        if metrics.val_accuracy > self.state.best_accuracy {
            info!(
                "Validation accuracy improved from {:.4} to {:.4}",
                self.state.best_accuracy, metrics.val_accuracy
            );
            self.state.best_accuracy = metrics.val_accuracy;
            self.state.best_epoch = Some(metrics.epoch);
            self.state.patience_counter = 0;
            EpochVerdict::Improved
        } else {
            self.state.patience_counter += 1;
            debug!(
                "No improvement. Patience: {}/{}",
                self.state.patience_counter, self.early_stopping_patience
            );
            EpochVerdict::Stalled {
                patience_counter: self.state.patience_counter,
            }
        }
    }

    pub fn should_stop(&self) -> bool {
        self.state.patience_counter >= self.early_stopping_patience
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn metrics(epoch: usize, val_accuracy: f64) -> EpochMetrics {
        EpochMetrics {
            epoch,
            train_loss: 1.0,
            train_accuracy: 0.5,
            val_loss: 1.0,
            val_accuracy,
            val_top5: 0.9,
            learning_rate: 1e-4,
        }
    }

    #[test]
    fn test_only_strict_increase_improves() {
        let mut trainer = Trainer::new(5);

        assert_eq!(trainer.update_epoch(metrics(1, 0.5)), EpochVerdict::Improved);
        assert_eq!(
            trainer.update_epoch(metrics(2, 0.5)),
            EpochVerdict::Stalled { patience_counter: 1 }
        );
        assert_eq!(trainer.update_epoch(metrics(3, 0.6)), EpochVerdict::Improved);
        assert_eq!(trainer.state().best_epoch, Some(3));
        assert_eq!(trainer.state().patience_counter, 0);
    }

    #[test]
    fn test_early_stop_after_exactly_patience_epochs() {
        let mut trainer = Trainer::new(3);
        trainer.update_epoch(metrics(1, 0.7));

        trainer.update_epoch(metrics(2, 0.6));
        assert!(!trainer.should_stop());
        trainer.update_epoch(metrics(3, 0.7));
        assert!(!trainer.should_stop());
        trainer.update_epoch(metrics(4, 0.65));
        assert!(trainer.should_stop());
    }

    #[test]
    fn test_first_epoch_at_zero_accuracy_is_not_improvement() {
        let mut trainer = Trainer::new(1);
        assert!(matches!(
            trainer.update_epoch(metrics(1, 0.0)),
            EpochVerdict::Stalled { .. }
        ));
        assert!(trainer.should_stop());
    }

    #[test]
    fn test_resume() {
        let mut trainer = Trainer::new(2);
        trainer.resume_from(4, 0.8);
        assert_eq!(trainer.state().epoch, 4);
        assert!(matches!(
            trainer.update_epoch(metrics(5, 0.8)),
            EpochVerdict::Stalled { .. }
        ));
    }

    #[test]
    fn test_csv_log_appends_with_single_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("training_log_test.csv");

        metrics(1, 0.5).append_csv(&path).unwrap();
        metrics(2, 0.6).append_csv(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[2].starts_with("2,1.000000,0.500000,1.000000,0.600000"));
    }
}
