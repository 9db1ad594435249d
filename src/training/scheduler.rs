//! Reduce-on-plateau learning rate scheduling.
//!
//! Watches a metric once per epoch and multiplies the learning rate by
//! `factor` after more than `patience` epochs without a relative improvement
//! of at least `threshold`. The rate never drops below `min_lr`.

use serde::{Deserialize, Serialize};

/// Whether a lower or higher metric counts as better
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlateauMode {
    Min,
    Max,
}

/// Reduce-on-plateau settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlateauConfig {
    pub mode: PlateauMode,
    pub factor: f64,
    pub patience: usize,
    pub threshold: f64,
    pub min_lr: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            mode: PlateauMode::Min,
            factor: 0.5,
            patience: 2,
            threshold: 1e-4,
            min_lr: 1e-7,
        }
    }
}

/// Mutable part of the scheduler, persisted with checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlateauState {
    pub learning_rate: f64,
    pub best_metric: Option<f64>,
    pub bad_epochs: usize,
}

/// Learning rate scheduler driven by a validation metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningRateScheduler {
    config: PlateauConfig,
    current_lr: f64,
    best_metric: Option<f64>,
    bad_epochs: usize,
}

impl LearningRateScheduler {
    pub fn new(config: PlateauConfig, base_lr: f64) -> Self {
        Self {
            config,
            current_lr: base_lr,
            best_metric: None,
            bad_epochs: 0,
        }
    }

    pub fn get_lr(&self) -> f64 {
        self.current_lr
    }

    pub fn best_metric(&self) -> Option<f64> {
        self.best_metric
    }

    pub fn state(&self) -> PlateauState {
        PlateauState {
            learning_rate: self.current_lr,
            best_metric: self.best_metric,
            bad_epochs: self.bad_epochs,
        }
    }

    /// Continue from a saved state
    pub fn restore(&mut self, state: PlateauState) {
        self.current_lr = state.learning_rate;
        self.best_metric = state.best_metric;
        self.bad_epochs = state.bad_epochs;
    }

    fn is_better(&self, metric: f64, best: f64) -> bool {
        match self.config.mode {
            PlateauMode::Min => metric < best * (1.0 - self.config.threshold),
            PlateauMode::Max => metric > best * (1.0 + self.config.threshold),
        }
    }

    /// Record the epoch's metric; returns `Some((old, new))` when the rate was reduced
    pub fn step_with_metric(&mut self, metric: f64) -> Option<(f64, f64)> {
        if metric.is_nan() {
            self.bad_epochs += 1;
        } else {
            let improved = match self.best_metric {
                Some(best) => self.is_better(metric, best),
                None => true,
            };

            if improved {
                self.best_metric = Some(metric);
                self.bad_epochs = 0;
            } else {
                self.bad_epochs += 1;
            }
        }

        if self.bad_epochs > self.config.patience {
            self.bad_epochs = 0;
            let old_lr = self.current_lr;
            let new_lr = (old_lr * self.config.factor).max(self.config.min_lr);
            if old_lr - new_lr > 1e-12 {
                self.current_lr = new_lr;
                return Some((old_lr, new_lr));
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduces_after_patience_exceeded() {
        let mut scheduler = LearningRateScheduler::new(PlateauConfig::default(), 1e-3);

        assert_eq!(scheduler.step_with_metric(1.0), None);
        assert_eq!(scheduler.step_with_metric(1.0), None); // bad 1
        assert_eq!(scheduler.step_with_metric(1.0), None); // bad 2
        let reduced = scheduler.step_with_metric(1.0); // bad 3 > patience
        assert_eq!(reduced, Some((1e-3, 5e-4)));
        assert_eq!(scheduler.get_lr(), 5e-4);
    }

    #[test]
    fn test_improvement_resets_counter() {
        let mut scheduler = LearningRateScheduler::new(PlateauConfig::default(), 1e-3);

        scheduler.step_with_metric(1.0);
        scheduler.step_with_metric(1.0);
        scheduler.step_with_metric(1.0);
        scheduler.step_with_metric(0.5);
        scheduler.step_with_metric(0.5);
        scheduler.step_with_metric(0.5);
        assert_eq!(scheduler.get_lr(), 1e-3);
        assert_eq!(scheduler.best_metric(), Some(0.5));
    }

    #[test]
    fn test_tiny_improvement_is_not_improvement() {
        let mut scheduler = LearningRateScheduler::new(PlateauConfig::default(), 1e-3);

        scheduler.step_with_metric(1.0);
        scheduler.step_with_metric(0.99999);
        scheduler.step_with_metric(0.99998);
        assert!(scheduler.step_with_metric(0.99997).is_some());
    }

    #[test]
    fn test_restored_state_keeps_counting() {
        let mut scheduler = LearningRateScheduler::new(PlateauConfig::default(), 1e-3);
        scheduler.step_with_metric(1.0);
        scheduler.step_with_metric(1.0);
        scheduler.step_with_metric(1.0);
        let saved = scheduler.state();
        assert_eq!(
            saved,
            PlateauState {
                learning_rate: 1e-3,
                best_metric: Some(1.0),
                bad_epochs: 2
            }
        );

        let mut resumed = LearningRateScheduler::new(PlateauConfig::default(), 1e-3);
        resumed.restore(saved);
        // A fresh scheduler would treat this as its first metric
        assert_eq!(resumed.step_with_metric(1.0), Some((1e-3, 5e-4)));
    }

    #[test]
    fn test_floor() {
        let config = PlateauConfig {
            patience: 0,
            min_lr: 1e-4,
            ..PlateauConfig::default()
        };
        let mut scheduler = LearningRateScheduler::new(config, 3e-4);

        scheduler.step_with_metric(1.0);
        assert!(scheduler.step_with_metric(1.0).is_some());
        assert!((scheduler.get_lr() - 1.5e-4).abs() < 1e-12);
        assert!(scheduler.step_with_metric(1.0).is_some());
        assert!((scheduler.get_lr() - 1e-4).abs() < 1e-12);
        // Already at the floor
        assert!(scheduler.step_with_metric(1.0).is_none());
    }

    #[test]
    fn test_max_mode() {
        let config = PlateauConfig {
            mode: PlateauMode::Max,
            patience: 0,
            ..PlateauConfig::default()
        };
        let mut scheduler = LearningRateScheduler::new(config, 1e-3);

        scheduler.step_with_metric(0.5);
        assert!(scheduler.step_with_metric(0.6).is_none());
        assert!(scheduler.step_with_metric(0.4).is_some());
    }
}
