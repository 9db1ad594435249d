//! Inference module for single-image and batch prediction

pub mod predictor;

pub use predictor::{top_k, BatchItemResult, BatchOutcome, Prediction, Predictor};
