//! Supervised Training Loop
//!
//! A custom epoch loop on Burn's primitives rather than the high-level
//! `LearnerBuilder`: shuffled batches, cross-entropy, Adam with weight decay,
//! validation on the inner backend, reduce-on-plateau scheduling on validation
//! loss, best-only checkpointing and early stopping.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{decay::WeightDecayConfig, AdamConfig, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::checkpoint::{CheckpointBundle, CheckpointMetadata};
use super::scheduler::{LearningRateScheduler, PlateauConfig, PlateauMode, PlateauState};
use super::state::{EpochMetrics, EpochVerdict, Trainer};
use crate::dataset::{ImageBatcher, ImageFolderDataset};
use crate::evaluation::evaluate_split;
use crate::model::{Classifier, ClassifierConfig};
use crate::utils::config::AppConfig;
use crate::utils::error::{Error, Result};
use crate::utils::logging::TrainingLogger;

/// Options that do not live in the configuration file
#[derive(Debug, Clone, Default)]
pub struct TrainOptions {
    /// Checkpoint directory to continue from
    pub resume: Option<PathBuf>,
    /// Backbone weights written by `export-backbone`
    pub pretrained_backbone: Option<PathBuf>,
    pub show_progress: bool,
}

/// What a finished run reports
#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    pub run_id: String,
    pub best_accuracy: f64,
    pub best_epoch: Option<usize>,
    pub epochs_run: usize,
    pub early_stopped: bool,
    pub checkpoint_dir: PathBuf,
    pub log_path: PathBuf,
    pub history: Vec<EpochMetrics>,
}

/// Loss and accuracy over one training epoch
#[derive(Debug, Clone, Copy, Default)]
struct EpochStats {
    loss: f64,
    accuracy: f64,
}

/// What to do once an epoch has been recorded
#[derive(Debug, Clone, PartialEq)]
pub struct EpochDecision {
    /// Metadata for a new best checkpoint; only set on a strict improvement
    pub checkpoint: Option<CheckpointMetadata>,
    pub stop: bool,
}

/// Per-epoch bookkeeping around the train and validate phases:
/// CSV log, plateau scheduling, best tracking and early stopping
pub struct EpochTracker {
    trainer: Trainer,
    scheduler: LearningRateScheduler,
    logger: TrainingLogger,
    log_path: PathBuf,
    run_id: String,
    class_names: Vec<String>,
    image_size: usize,
    num_epochs: usize,
    patience: usize,
    epochs_run: usize,
    early_stopped: bool,
}

impl EpochTracker {
    pub fn new(config: &AppConfig, class_names: Vec<String>) -> Self {
        let tc = &config.training;
        Self {
            trainer: Trainer::new(tc.early_stopping_patience),
            scheduler: LearningRateScheduler::new(
                PlateauConfig {
                    mode: PlateauMode::Min,
                    factor: tc.lr_factor,
                    patience: tc.lr_patience,
                    ..PlateauConfig::default()
                },
                tc.learning_rate,
            ),
            logger: TrainingLogger::new(tc.num_epochs),
            log_path: config.training_log_path(),
            run_id: config.run_id.clone(),
            class_names,
            image_size: config.data.image_size,
            num_epochs: tc.num_epochs,
            patience: tc.early_stopping_patience,
            epochs_run: 0,
            early_stopped: false,
        }
    }

    /// Continue after the epoch recorded in `metadata`
    pub fn resume(&mut self, metadata: &CheckpointMetadata) {
        self.trainer.resume_from(metadata.epoch, metadata.best_accuracy);
        let state = metadata.scheduler.unwrap_or(PlateauState {
            learning_rate: metadata.learning_rate,
            best_metric: None,
            bad_epochs: 0,
        });
        self.scheduler.restore(state);
    }

    /// Epochs still to run, 1-based
    pub fn remaining_epochs(&self) -> RangeInclusive<usize> {
        (self.trainer.state().epoch + 1)..=self.num_epochs
    }

    /// Epochs completed before this run started
    pub fn completed_epochs(&self) -> usize {
        self.trainer.state().epoch
    }

    pub fn learning_rate(&self) -> f64 {
        self.scheduler.get_lr()
    }

    pub fn begin_epoch(&mut self, epoch: usize) {
        self.logger.start_epoch(epoch - 1);
    }

    /// Log the epoch, step the scheduler and decide on checkpointing and stopping
    pub fn finish_epoch(&mut self, metrics: EpochMetrics) -> Result<EpochDecision> {
        metrics.append_csv(&self.log_path)?;
        self.logger.end_epoch(
            metrics.train_loss,
            metrics.val_loss,
            metrics.val_accuracy,
            metrics.learning_rate,
        );
        self.epochs_run += 1;

        if let Some((old, new)) = self.scheduler.step_with_metric(metrics.val_loss) {
            self.logger.log_lr_reduced(old, new);
        }

        let checkpoint = match self.trainer.update_epoch(metrics) {
            EpochVerdict::Improved => {
                self.logger.log_new_best(metrics.val_accuracy);
                Some(
                    CheckpointMetadata::new(
                        self.run_id.clone(),
                        metrics.epoch,
                        metrics.val_accuracy,
                        self.scheduler.get_lr(),
                        self.class_names.clone(),
                        self.image_size,
                    )
                    .with_scheduler(self.scheduler.state()),
                )
            }
            EpochVerdict::Stalled { patience_counter } => {
                debug!("Epoch {} did not improve ({} in a row)", metrics.epoch, patience_counter);
                None
            }
        };

        let stop = self.trainer.should_stop();
        if stop {
            self.logger.log_early_stop(self.patience);
            self.early_stopped = true;
        }

        Ok(EpochDecision { checkpoint, stop })
    }

    pub fn into_summary(self, checkpoint_dir: PathBuf) -> TrainingSummary {
        let state = self.trainer.state();
        self.logger.log_complete(self.epochs_run, state.best_accuracy);

        TrainingSummary {
            run_id: self.run_id.clone(),
            best_accuracy: state.best_accuracy,
            best_epoch: state.best_epoch,
            epochs_run: self.epochs_run,
            early_stopped: self.early_stopped,
            checkpoint_dir,
            log_path: self.log_path.clone(),
            history: state.history.clone(),
        }
    }
}

/// The model-facing half of an epoch
pub trait EpochRunner {
    /// Train for one epoch and validate, returning the epoch's metrics
    fn run_epoch(&mut self, epoch: usize, learning_rate: f64) -> Result<EpochMetrics>;

    /// Persist the current weights as the new best checkpoint
    fn save_checkpoint(&mut self, metadata: &CheckpointMetadata) -> Result<()>;
}

/// Drive epochs until the configured count or early stopping
pub fn run_epochs<R: EpochRunner>(tracker: &mut EpochTracker, runner: &mut R) -> Result<()> {
    for epoch in tracker.remaining_epochs() {
        tracker.begin_epoch(epoch);
        let metrics = runner.run_epoch(epoch, tracker.learning_rate())?;

        let decision = tracker.finish_epoch(metrics)?;
        if let Some(metadata) = &decision.checkpoint {
            runner.save_checkpoint(metadata)?;
        }
        if decision.stop {
            break;
        }
    }
    Ok(())
}

/// Train on `processed/train`, validate on `processed/val`
///
/// # Type Parameters
/// * `B` - The autodiff backend (e.g. `Autodiff<NdArray>` or `Autodiff<Cuda>`)
pub fn run_training<B>(
    config: &AppConfig,
    options: &TrainOptions,
    device: &B::Device,
) -> Result<TrainingSummary>
where
    B: AutodiffBackend,
{
    config.validate()?;
    config.prepare_directories()?;

    let train_dataset = ImageFolderDataset::from_dir(config.train_dir())?;
    let val_dataset = ImageFolderDataset::from_dir(config.val_dir())?;
    val_dataset
        .classes()
        .ensure_matches(train_dataset.classes().names(), "validation split vs training split")?;

    let batch_size = config.data.batch_size;
    if train_dataset.is_empty() {
        return Err(Error::Dataset(format!(
            "No training images found in {:?}",
            config.train_dir()
        )));
    }
    if train_dataset.len() < batch_size {
        return Err(Error::Training(format!(
            "{} training images cannot fill a single batch of {}",
            train_dataset.len(),
            batch_size
        )));
    }

    let class_names = train_dataset.classes().names().to_vec();
    info!(
        "Training on {} samples, validating on {} ({} classes)",
        train_dataset.len(),
        val_dataset.len(),
        class_names.len()
    );
    debug!("Training class distribution: {:?}", train_dataset.class_distribution());

    let tc = &config.training;
    let adam = AdamConfig::new().with_weight_decay(Some(WeightDecayConfig::new(tc.weight_decay as f32)));
    let mut optimizer = adam.init::<B, Classifier<B>>();
    let mut tracker = EpochTracker::new(config, class_names.clone());

    let (model, model_config) = match &options.resume {
        Some(dir) => {
            let bundle = CheckpointBundle::new(dir);
            let (model, model_config, metadata) = bundle.load_model::<B>(device)?;
            train_dataset
                .classes()
                .ensure_matches(&metadata.class_names, "training split vs resumed checkpoint")?;
            optimizer = bundle.load_optimizer::<B, _>(optimizer, device)?;
            tracker.resume(&metadata);
            info!(
                "Resuming from {:?} after epoch {} (best accuracy {:.4})",
                dir, metadata.epoch, metadata.best_accuracy
            );
            (model, model_config)
        }
        None => {
            let model_config = ClassifierConfig::new(class_names.len())
                .with_dropout(tc.dropout)
                .with_base_filters(tc.base_filters)
                .with_hidden_size(tc.hidden_size);
            let model = match &options.pretrained_backbone {
                Some(path) => model_config.init_with_backbone::<B>(path, device)?,
                None => model_config.init::<B>(device),
            };
            (model, model_config)
        }
    };

    let data = &config.data;
    let checkpoint = CheckpointBundle::new(config.checkpoint_dir());
    let mut runner = BurnEpochRunner {
        model: Some(model),
        optimizer,
        model_config,
        train_dataset: &train_dataset,
        val_dataset: &val_dataset,
        train_batcher: ImageBatcher::train(data.image_size, data.resize_margin, data.on_decode_error, tc.seed),
        val_batcher: ImageBatcher::eval(data.image_size, data.resize_margin, data.on_decode_error),
        batch_size,
        shuffle_rng: ChaCha8Rng::seed_from_u64(tc.seed.wrapping_add(tracker.completed_epochs() as u64)),
        checkpoint: checkpoint.clone(),
        device,
        show_progress: options.show_progress,
    };

    run_epochs(&mut tracker, &mut runner)?;

    Ok(tracker.into_summary(checkpoint.dir().to_path_buf()))
}

/// Trains and validates a Burn classifier
struct BurnEpochRunner<'a, B: AutodiffBackend, O> {
    /// Taken out for the duration of a training pass
    model: Option<Classifier<B>>,
    optimizer: O,
    model_config: ClassifierConfig,
    train_dataset: &'a ImageFolderDataset,
    val_dataset: &'a ImageFolderDataset,
    train_batcher: ImageBatcher<B>,
    val_batcher: ImageBatcher<B::InnerBackend>,
    batch_size: usize,
    shuffle_rng: ChaCha8Rng,
    checkpoint: CheckpointBundle,
    device: &'a B::Device,
    show_progress: bool,
}

impl<B, O> BurnEpochRunner<'_, B, O>
where
    B: AutodiffBackend,
    O: Optimizer<Classifier<B>, B>,
{
    fn model(&self) -> Result<&Classifier<B>> {
        self.model
            .as_ref()
            .ok_or_else(|| Error::Training("model missing after an interrupted epoch".to_string()))
    }
}

impl<B, O> EpochRunner for BurnEpochRunner<'_, B, O>
where
    B: AutodiffBackend,
    O: Optimizer<Classifier<B>, B>,
{
    fn run_epoch(&mut self, epoch: usize, learning_rate: f64) -> Result<EpochMetrics> {
        let model = self
            .model
            .take()
            .ok_or_else(|| Error::Training("model missing after an interrupted epoch".to_string()))?;

        let (trained, train_stats) = train_epoch(
            model,
            &mut self.optimizer,
            self.train_dataset,
            &self.train_batcher,
            self.batch_size,
            learning_rate,
            &mut self.shuffle_rng,
            self.device,
            self.show_progress,
        );
        let valid_model = trained.valid();
        self.model = Some(trained);

        let val = evaluate_split(&valid_model, self.val_dataset, &self.val_batcher, self.batch_size, self.device);
        if val.failures > 0 {
            warn!("{} validation images failed to decode", val.failures);
        }

        Ok(EpochMetrics {
            epoch,
            train_loss: train_stats.loss,
            train_accuracy: train_stats.accuracy,
            val_loss: val.loss,
            val_accuracy: val.accuracy,
            val_top5: val.top5_accuracy,
            learning_rate,
        })
    }

    fn save_checkpoint(&mut self, metadata: &CheckpointMetadata) -> Result<()> {
        self.checkpoint
            .save(self.model()?, &self.optimizer, &self.model_config, metadata)
    }
}

/// Shuffled index batches of exactly `batch_size`; the trailing partial batch is dropped
fn full_batches(len: usize, batch_size: usize, rng: &mut ChaCha8Rng) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(rng);
    indices
        .chunks_exact(batch_size.max(1))
        .map(<[usize]>::to_vec)
        .collect()
}

/// One pass over the shuffled training set
#[allow(clippy::too_many_arguments)]
fn train_epoch<B, O>(
    mut model: Classifier<B>,
    optimizer: &mut O,
    dataset: &ImageFolderDataset,
    batcher: &ImageBatcher<B>,
    batch_size: usize,
    learning_rate: f64,
    rng: &mut ChaCha8Rng,
    device: &B::Device,
    show_progress: bool,
) -> (Classifier<B>, EpochStats)
where
    B: AutodiffBackend,
    O: Optimizer<Classifier<B>, B>,
{
    let batches = full_batches(dataset.len(), batch_size, rng);
    let progress = progress_bar(batches.len(), show_progress);
    let loss_fn = CrossEntropyLossConfig::new().init(device);

    let mut loss_sum = 0.0f64;
    let mut correct = 0usize;
    let mut seen = 0usize;

    for chunk in &batches {
        let items: Vec<_> = chunk.iter().filter_map(|&i| dataset.get(i)).collect();
        let batch = batcher.batch(items, device);
        progress.inc(1);
        if batch.is_empty() {
            continue;
        }

        let n = batch.len();
        let output = model.forward(batch.images);
        let loss = loss_fn.forward(output.clone(), batch.targets.clone());

        let loss_value: f64 = loss.clone().into_scalar().elem();
        let batch_correct: i64 = output
            .argmax(1)
            .reshape([n])
            .equal(batch.targets)
            .int()
            .sum()
            .into_scalar()
            .elem();

        loss_sum += loss_value * n as f64;
        correct += batch_correct as usize;
        seen += n;

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optimizer.step(learning_rate, model, grads);

        progress.set_message(format!("loss {:.4}", loss_value));
    }
    progress.finish_and_clear();

    let stats = if seen > 0 {
        EpochStats {
            loss: loss_sum / seen as f64,
            accuracy: correct as f64 / seen as f64,
        }
    } else {
        EpochStats::default()
    };
    (model, stats)
}

fn progress_bar(len: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("  {bar:40.cyan/blue} {pos}/{len} batches {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}

/// Whether a checkpoint from a previous run can be resumed
pub fn can_resume(dir: &Path) -> bool {
    CheckpointBundle::new(dir).exists()
}
