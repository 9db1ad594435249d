//! Training module
//!
//! This module provides:
//! - The supervised epoch loop on Burn primitives
//! - Reduce-on-plateau learning rate scheduling
//! - Best-accuracy tracking and early stopping
//! - Checkpoint bundles (weights, optimizer state, config, class list)

pub mod checkpoint;
pub mod scheduler;
pub mod state;
pub mod supervised;

pub use checkpoint::{CheckpointBundle, CheckpointMetadata};
pub use scheduler::{LearningRateScheduler, PlateauConfig, PlateauMode, PlateauState};
pub use state::{EpochMetrics, EpochVerdict, Trainer, TrainingState};
pub use supervised::{
    can_resume, run_epochs, run_training, EpochDecision, EpochRunner, EpochTracker, TrainOptions, TrainingSummary,
};
