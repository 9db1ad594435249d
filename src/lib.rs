//! # leafscan
//!
//! Leaf disease image classification with the Burn framework.
//!
//! ## Modules
//!
//! - `dataset`: image validation/cleaning, class-folder indexing, transforms and batching
//! - `model`: convolutional backbone with a dropout/batch-norm classification head
//! - `training`: epoch loop, plateau scheduler, early stopping and checkpoint bundles
//! - `evaluation`: confusion matrix, classification report and evaluation artifacts
//! - `inference`: top-k prediction from bytes or paths, batch prediction, embeddings
//! - `utils`: configuration, errors and logging
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use leafscan::backend::{default_device, InferenceBackend};
//! use leafscan::inference::Predictor;
//!
//! let predictor = Predictor::<InferenceBackend>::load(
//!     "models/best_model_20240101_000000".as_ref(),
//!     leafscan::RESIZE_MARGIN,
//!     &default_device(),
//! )?;
//! let top = predictor.predict_path("leaf.jpg".as_ref(), leafscan::DEFAULT_TOP_K)?;
//! ```

pub mod backend;
pub mod dataset;
pub mod evaluation;
pub mod inference;
pub mod model;
pub mod training;
pub mod utils;

pub use dataset::{ClassIndex, DecodeFailurePolicy, ImageFolder, ImageFolderDataset, LoadOutcome};
pub use evaluation::{ClassificationReport, ConfusionMatrix, Evaluator};
pub use inference::{BatchItemResult, Prediction, Predictor};
pub use model::{Classifier, ClassifierConfig};
pub use training::{run_training, CheckpointBundle, TrainOptions, TrainingSummary};
pub use utils::config::AppConfig;
pub use utils::error::{Error, Result};

/// Default side of the square network input
pub const IMAGE_SIZE: usize = 224;

/// Pixels added to each side length before the center crop
pub const RESIZE_MARGIN: usize = 32;

/// Default number of predictions returned
pub const DEFAULT_TOP_K: usize = 5;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
