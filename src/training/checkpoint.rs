//! Checkpoint bundles.
//!
//! A checkpoint is a directory (`models/best_model_{run_id}/`) holding:
//! - `model.mpk`: model parameters
//! - `optimizer.mpk`: optimizer state
//! - `model_config.json`: the [`ClassifierConfig`]
//! - `checkpoint.json`: [`CheckpointMetadata`], including the class list
//!
//! Loading checks that the class list, the configured class count and the
//! width of the restored head all agree.

use std::fs;
use std::path::{Path, PathBuf};

use burn::config::Config;
use burn::module::Module;
use burn::optim::Optimizer;
use burn::record::{CompactRecorder, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::scheduler::PlateauState;
use crate::model::{Classifier, ClassifierConfig};
use crate::utils::error::{Error, Result};

/// Model parameter file stem (the recorder adds `.mpk`)
pub const MODEL_FILE: &str = "model";
/// Optimizer state file stem (the recorder adds `.mpk`)
pub const OPTIMIZER_FILE: &str = "optimizer";
pub const CONFIG_FILE: &str = "model_config.json";
pub const METADATA_FILE: &str = "checkpoint.json";

/// Metadata stored next to the weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub run_id: String,
    /// Epoch (1-based) that produced the weights
    pub epoch: usize,
    pub best_accuracy: f64,
    pub learning_rate: f64,
    pub num_classes: usize,
    pub class_names: Vec<String>,
    pub image_size: usize,
    pub timestamp: String,
    /// Plateau scheduler state at save time; absent in older checkpoints
    #[serde(default)]
    pub scheduler: Option<PlateauState>,
}

impl CheckpointMetadata {
    pub fn new(
        run_id: impl Into<String>,
        epoch: usize,
        best_accuracy: f64,
        learning_rate: f64,
        class_names: Vec<String>,
        image_size: usize,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            epoch,
            best_accuracy,
            learning_rate,
            num_classes: class_names.len(),
            class_names,
            image_size,
            timestamp: Utc::now().to_rfc3339(),
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, state: PlateauState) -> Self {
        self.scheduler = Some(state);
        self
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize checkpoint: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .map_err(|e| Error::Checkpoint(format!("Failed to read {:?}: {}", path, e)))?;

        serde_json::from_str(&json)
            .map_err(|e| Error::Serialization(format!("Failed to deserialize checkpoint: {}", e)))
    }

    /// The class list must have exactly `num_classes` entries
    pub fn validate(&self) -> Result<()> {
        if self.class_names.len() != self.num_classes {
            return Err(Error::ClassMismatch {
                expected: self.num_classes,
                found: self.class_names.len(),
                context: "class_names in checkpoint metadata".to_string(),
            });
        }
        Ok(())
    }
}

/// A checkpoint directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointBundle {
    dir: PathBuf,
}

impl CheckpointBundle {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(MODEL_FILE)
    }

    pub fn optimizer_path(&self) -> PathBuf {
        self.dir.join(OPTIMIZER_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// Whether the metadata and model files are present
    pub fn exists(&self) -> bool {
        self.metadata_path().is_file() && self.model_path().with_extension("mpk").is_file()
    }

    /// Write the full bundle, replacing any previous contents
    pub fn save<B, O>(
        &self,
        model: &Classifier<B>,
        optimizer: &O,
        config: &ClassifierConfig,
        metadata: &CheckpointMetadata,
    ) -> Result<()>
    where
        B: AutodiffBackend,
        O: Optimizer<Classifier<B>, B>,
    {
        metadata.validate()?;
        fs::create_dir_all(&self.dir)?;

        let recorder = CompactRecorder::new();
        model
            .clone()
            .save_file(self.model_path(), &recorder)
            .map_err(|e| Error::Checkpoint(format!("Failed to save model: {:?}", e)))?;

        <CompactRecorder as Recorder<B>>::record(&recorder, optimizer.to_record(), self.optimizer_path())
            .map_err(|e| Error::Checkpoint(format!("Failed to save optimizer: {:?}", e)))?;

        config
            .save(self.config_path())
            .map_err(|e| Error::Checkpoint(format!("Failed to save model config: {}", e)))?;

        metadata.save(&self.metadata_path())?;

        info!(
            "Checkpoint saved to {:?} (epoch {}, accuracy {:.4})",
            self.dir, metadata.epoch, metadata.best_accuracy
        );
        Ok(())
    }

    pub fn load_metadata(&self) -> Result<CheckpointMetadata> {
        let metadata = CheckpointMetadata::load(&self.metadata_path())?;
        metadata.validate()?;
        Ok(metadata)
    }

    pub fn load_config(&self) -> Result<ClassifierConfig> {
        ClassifierConfig::load(self.config_path()).map_err(|e| {
            Error::Checkpoint(format!(
                "Failed to load model config from {:?}: {:?}",
                self.config_path(),
                e
            ))
        })
    }

    /// Restore the model and verify it against the stored class list
    pub fn load_model<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<(Classifier<B>, ClassifierConfig, CheckpointMetadata)> {
        if !self.dir.is_dir() {
            return Err(Error::PathNotFound(self.dir.clone()));
        }

        let metadata = self.load_metadata()?;
        let config = self.load_config()?;

        if config.num_classes != metadata.num_classes {
            return Err(Error::ClassMismatch {
                expected: metadata.num_classes,
                found: config.num_classes,
                context: "model_config.json num_classes".to_string(),
            });
        }

        let model = config
            .init::<B>(device)
            .load_file(self.model_path(), &CompactRecorder::new(), device)
            .map_err(|e| Error::Checkpoint(format!("Failed to load model weights: {:?}", e)))?;
        model.ensure_num_classes(metadata.num_classes)?;

        info!(
            "Loaded checkpoint {:?} (run {}, epoch {}, {} classes)",
            self.dir, metadata.run_id, metadata.epoch, metadata.num_classes
        );
        Ok((model, config, metadata))
    }

    /// Restore optimizer state saved by [`CheckpointBundle::save`]
    pub fn load_optimizer<B, O>(&self, optimizer: O, device: &B::Device) -> Result<O>
    where
        B: AutodiffBackend,
        O: Optimizer<Classifier<B>, B>,
    {
        let record = <CompactRecorder as Recorder<B>>::load::<O::Record>(
            &CompactRecorder::new(),
            self.optimizer_path(),
            device,
        )
        .map_err(|e| Error::Checkpoint(format!("Failed to load optimizer state: {:?}", e)))?;

        Ok(optimizer.load_record(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::optim::AdamConfig;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TrainBackend = Autodiff<NdArray<f32>>;
    type InferBackend = NdArray<f32>;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("class_{i}")).collect()
    }

    fn tiny_config(num_classes: usize) -> ClassifierConfig {
        ClassifierConfig::new(num_classes)
            .with_base_filters(2)
            .with_hidden_size(8)
    }

    #[test]
    fn test_metadata_roundtrip_and_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(METADATA_FILE);

        let metadata = CheckpointMetadata::new("run1", 3, 0.75, 1e-4, names(3), 224).with_scheduler(PlateauState {
            learning_rate: 1e-4,
            best_metric: Some(0.42),
            bad_epochs: 1,
        });
        assert_eq!(metadata.num_classes, 3);
        metadata.save(&path).unwrap();

        let loaded = CheckpointMetadata::load(&path).unwrap();
        assert_eq!(loaded, metadata);

        let mut broken = loaded;
        broken.num_classes = 4;
        assert!(matches!(broken.validate(), Err(Error::ClassMismatch { .. })));
    }

    #[test]
    fn test_metadata_without_scheduler_state_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(METADATA_FILE);

        let mut json = serde_json::to_value(CheckpointMetadata::new("old", 1, 0.5, 1e-4, names(2), 64)).unwrap();
        json.as_object_mut().unwrap().remove("scheduler");
        fs::write(&path, json.to_string()).unwrap();

        let loaded = CheckpointMetadata::load(&path).unwrap();
        assert_eq!(loaded.scheduler, None);
        assert_eq!(loaded.epoch, 1);
    }

    #[test]
    fn test_bundle_save_and_load() {
        let dir = TempDir::new().unwrap();
        let bundle = CheckpointBundle::new(dir.path().join("best_model_run1"));
        let device = Default::default();

        let config = tiny_config(3);
        let model = config.init::<TrainBackend>(&device);
        let optimizer = AdamConfig::new().init::<TrainBackend, Classifier<TrainBackend>>();
        let metadata = CheckpointMetadata::new("run1", 2, 0.5, 1e-4, names(3), 32);

        assert!(!bundle.exists());
        bundle.save(&model, &optimizer, &config, &metadata).unwrap();
        assert!(bundle.exists());
        assert!(bundle.config_path().is_file());

        let (loaded, loaded_config, loaded_meta) = bundle.load_model::<InferBackend>(&device).unwrap();
        assert_eq!(loaded.num_classes(), 3);
        assert_eq!(loaded_config.base_filters, 2);
        assert_eq!(loaded_meta.class_names, names(3));

        let optimizer = AdamConfig::new().init::<TrainBackend, Classifier<TrainBackend>>();
        assert!(bundle.load_optimizer::<TrainBackend, _>(optimizer, &device).is_ok());
    }

    #[test]
    fn test_class_count_mismatch_fails_loudly() {
        let dir = TempDir::new().unwrap();
        let bundle = CheckpointBundle::new(dir.path().join("ckpt"));
        let device = Default::default();

        let config = tiny_config(3);
        let model = config.init::<TrainBackend>(&device);
        let optimizer = AdamConfig::new().init::<TrainBackend, Classifier<TrainBackend>>();
        bundle
            .save(&model, &optimizer, &config, &CheckpointMetadata::new("r", 1, 0.1, 1e-4, names(3), 32))
            .unwrap();

        // Tamper with the stored class list
        let mut metadata = bundle.load_metadata().unwrap();
        metadata.class_names.push("extra".to_string());
        metadata.num_classes = 4;
        metadata.save(&bundle.metadata_path()).unwrap();

        let err = bundle.load_model::<InferBackend>(&device).unwrap_err();
        assert!(matches!(err, Error::ClassMismatch { expected: 4, found: 3, .. }));
    }

    #[test]
    fn test_missing_bundle() {
        let dir = TempDir::new().unwrap();
        let bundle = CheckpointBundle::new(dir.path().join("missing"));
        let err = bundle.load_model::<InferBackend>(&Default::default()).unwrap_err();
        assert!(matches!(err, Error::PathNotFound(_)));
    }
}
