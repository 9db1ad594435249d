//! Held-out evaluation
//!
//! [`evaluate_split`] runs one deterministic pass over a dataset and is shared
//! with the validation phase of training. [`Evaluator`] wraps it for a saved
//! checkpoint and writes the report artifacts.

use std::fs;
use std::path::{Path, PathBuf};

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::tensor::backend::Backend;
use burn::tensor::ElementConversion;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::metrics::{AccuracyTracker, ClassificationReport, ConfusionMatrix, RunningAverage};
use crate::dataset::{DecodeFailurePolicy, ImageBatcher, ImageFolderDataset};
use crate::model::Classifier;
use crate::training::checkpoint::CheckpointBundle;
use crate::utils::config::AppConfig;
use crate::utils::error::{Error, Result};

/// Top-k used for the secondary accuracy figure
pub const TOP_K_EVAL: usize = 5;

/// Outcome of one pass over a split
#[derive(Debug, Clone, Default)]
pub struct SplitEvaluation {
    /// Sample-weighted mean cross-entropy
    pub loss: f64,
    pub accuracy: f64,
    pub top5_accuracy: f64,
    pub predictions: Vec<usize>,
    pub labels: Vec<usize>,
    /// Samples that failed to decode
    pub failures: usize,
}

impl SplitEvaluation {
    pub fn num_samples(&self) -> usize {
        self.labels.len()
    }

    pub fn confusion_matrix(&self, num_classes: usize) -> ConfusionMatrix {
        ConfusionMatrix::from_predictions(&self.predictions, &self.labels, num_classes)
    }
}

/// Forward every sample of `dataset` through `model` in order
pub fn evaluate_split<B: Backend>(
    model: &Classifier<B>,
    dataset: &ImageFolderDataset,
    batcher: &ImageBatcher<B>,
    batch_size: usize,
    device: &B::Device,
) -> SplitEvaluation {
    let num_classes = model.num_classes();
    let loss_fn = CrossEntropyLossConfig::new().init(device);

    let mut loss = RunningAverage::new();
    let mut accuracy = AccuracyTracker::new();
    let mut result = SplitEvaluation::default();

    let len = dataset.len();
    for start in (0..len).step_by(batch_size.max(1)) {
        let end = (start + batch_size).min(len);
        let items: Vec<_> = (start..end).filter_map(|i| dataset.get(i)).collect();

        let batch = batcher.batch(items, device);
        result.failures += batch.failures.len();
        if batch.is_empty() {
            continue;
        }

        let n = batch.len();
        let output = model.forward(batch.images);
        let batch_loss: f64 = loss_fn
            .forward(output.clone(), batch.targets.clone())
            .into_scalar()
            .elem();
        loss.add(batch_loss, n);

        let scores: Vec<f32> = output.into_data().iter::<f32>().collect();
        let labels: Vec<usize> = batch
            .targets
            .into_data()
            .iter::<i64>()
            .map(|t| t as usize)
            .collect();

        accuracy.add_batch(&scores, &labels, num_classes, TOP_K_EVAL);
        result
            .predictions
            .extend(scores.chunks(num_classes).map(super::metrics::argmax));
        result.labels.extend(labels);
    }

    result.loss = loss.average();
    result.accuracy = accuracy.accuracy();
    result.top5_accuracy = accuracy.top_k_accuracy();
    result
}

/// JSON report written next to the confusion matrix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub run_id: String,
    pub checkpoint: PathBuf,
    pub split: PathBuf,
    pub num_samples: usize,
    pub decode_failures: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub top5_accuracy: f64,
    pub class_names: Vec<String>,
    pub report: ClassificationReport,
    pub confusion_matrix: ConfusionMatrix,
}

/// Paths of the files written by [`Evaluator::run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationArtifacts {
    pub heatmap: PathBuf,
    pub csv: PathBuf,
    pub json: PathBuf,
}

impl EvaluationArtifacts {
    pub fn new(logs_dir: &Path, run_id: &str) -> Self {
        Self {
            heatmap: logs_dir.join(format!("confusion_matrix_{}.png", run_id)),
            csv: logs_dir.join(format!("confusion_matrix_{}.csv", run_id)),
            json: logs_dir.join(format!("evaluation_{}.json", run_id)),
        }
    }
}

/// Evaluates a checkpoint against a held-out split
pub struct Evaluator<'a> {
    config: &'a AppConfig,
    checkpoint: CheckpointBundle,
}

impl<'a> Evaluator<'a> {
    pub fn new(config: &'a AppConfig, checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            checkpoint: CheckpointBundle::new(checkpoint_dir),
        }
    }

    /// Evaluate on `split_dir` and write the report artifacts under the logs directory
    pub fn run<B: Backend>(
        &self,
        split_dir: &Path,
        device: &B::Device,
    ) -> Result<(EvaluationReport, EvaluationArtifacts)> {
        let (model, _, metadata) = self.checkpoint.load_model::<B>(device)?;

        let dataset = ImageFolderDataset::from_dir(split_dir)?;
        dataset
            .classes()
            .ensure_matches(&metadata.class_names, "evaluation split vs checkpoint")?;
        if dataset.is_empty() {
            return Err(Error::Dataset(format!("No images found in {:?}", split_dir)));
        }

        info!(
            "Evaluating {:?} on {} samples from {:?}",
            self.checkpoint.dir(),
            dataset.len(),
            split_dir
        );

        let batcher = ImageBatcher::<B>::eval(
            metadata.image_size,
            self.config.data.resize_margin,
            DecodeFailurePolicy::Skip,
        );
        let split = evaluate_split(&model, &dataset, &batcher, self.config.data.batch_size, device);
        if split.failures > 0 {
            warn!("{} images could not be decoded and were skipped", split.failures);
        }

        let cm = split.confusion_matrix(metadata.num_classes);
        let report = ClassificationReport::from_confusion_matrix(&cm, &metadata.class_names);

        let evaluation = EvaluationReport {
            run_id: metadata.run_id.clone(),
            checkpoint: self.checkpoint.dir().to_path_buf(),
            split: split_dir.to_path_buf(),
            num_samples: split.num_samples(),
            decode_failures: split.failures,
            loss: split.loss,
            accuracy: split.accuracy,
            top5_accuracy: split.top5_accuracy,
            class_names: metadata.class_names.clone(),
            report,
            confusion_matrix: cm,
        };

        let artifacts = EvaluationArtifacts::new(&self.config.paths.logs_dir, &metadata.run_id);
        write_artifacts(&evaluation, &artifacts)?;

        info!(
            "Test loss {:.4} | accuracy {:.4} | top-5 {:.4}",
            evaluation.loss, evaluation.accuracy, evaluation.top5_accuracy
        );
        Ok((evaluation, artifacts))
    }
}

fn write_artifacts(evaluation: &EvaluationReport, artifacts: &EvaluationArtifacts) -> Result<()> {
    let cm = &evaluation.confusion_matrix;
    cm.save_heatmap(&artifacts.heatmap)?;
    cm.save_csv(&artifacts.csv, &evaluation.class_names)?;

    let json = serde_json::to_string_pretty(evaluation)?;
    fs::write(&artifacts.json, json)?;

    info!("Confusion matrix saved to {:?}", artifacts.heatmap);
    info!("Evaluation report saved to {:?}", artifacts.json);
    Ok(())
}
