//! Application configuration.
//!
//! Every value has a default, so a TOML file only needs the keys it wants to
//! override:
//!
//! ```toml
//! [training]
//! num_epochs = 50
//! learning_rate = 0.0003
//!
//! [server]
//! port = 8080
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dataset::DecodeFailurePolicy;
use crate::model::{DEFAULT_DROPOUT, DEFAULT_HIDDEN_SIZE};
use crate::utils::error::{Error, Result};

/// Top-level configuration shared by the CLI and the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Identifier for this run (timestamp), used to name checkpoints and logs
    pub run_id: String,
    pub paths: PathsConfig,
    pub data: DataConfig,
    pub training: TrainingSection,
    pub server: ServerSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            run_id: generate_run_id(),
            paths: PathsConfig::default(),
            data: DataConfig::default(),
            training: TrainingSection::default(),
            server: ServerSection::default(),
        }
    }
}

/// Directory layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Raw data root containing `train/`, `val/` and `test/`
    pub data_dir: PathBuf,
    /// Cleaned copy of the raw data root
    pub processed_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub models_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            processed_dir: PathBuf::from("data/processed"),
            logs_dir: PathBuf::from("logs"),
            models_dir: PathBuf::from("models"),
        }
    }
}

/// Input pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Side of the square network input
    pub image_size: usize,
    /// Extra pixels added before cropping back to `image_size`
    pub resize_margin: usize,
    pub batch_size: usize,
    /// What to do with samples that fail to decode
    pub on_decode_error: DecodeFailurePolicy,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            image_size: crate::IMAGE_SIZE,
            resize_margin: crate::RESIZE_MARGIN,
            batch_size: 32,
            on_decode_error: DecodeFailurePolicy::Skip,
        }
    }
}

/// Optimization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSection {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub num_epochs: usize,
    pub early_stopping_patience: usize,
    /// Multiplier applied to the learning rate on a plateau
    pub lr_factor: f64,
    /// Epochs without validation-loss improvement before the learning rate drops
    pub lr_patience: usize,
    pub seed: u64,
    pub dropout: f64,
    pub base_filters: usize,
    /// Width of the hidden layer in the classifier head
    pub hidden_size: usize,
}

impl Default for TrainingSection {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            weight_decay: 1e-5,
            num_epochs: 30,
            early_stopping_patience: 5,
            lr_factor: 0.5,
            lr_patience: 2,
            seed: 42,
            dropout: DEFAULT_DROPOUT,
            base_filters: 32,
            hidden_size: DEFAULT_HIDDEN_SIZE,
        }
    }
}

/// HTTP service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub top_k: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            top_k: crate::DEFAULT_TOP_K,
        }
    }
}

impl AppConfig {
    /// Load a configuration file, falling back to defaults for missing keys
    pub fn load(path: &Path) -> Result<Self> {
        let config: AppConfig = load_toml_config(path)?;
        info!("Loaded configuration from {:?} (run {})", path, config.run_id);
        Ok(config)
    }

    /// Load `path` when given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn train_dir(&self) -> PathBuf {
        self.paths.processed_dir.join("train")
    }

    pub fn val_dir(&self) -> PathBuf {
        self.paths.processed_dir.join("val")
    }

    pub fn test_dir(&self) -> PathBuf {
        self.paths.processed_dir.join("test")
    }

    /// Checkpoint bundle written by this run
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.paths
            .models_dir
            .join(format!("best_model_{}", self.run_id))
    }

    pub fn training_log_path(&self) -> PathBuf {
        self.paths
            .logs_dir
            .join(format!("training_log_{}.csv", self.run_id))
    }

    /// Create the processed, logs and models roots
    pub fn prepare_directories(&self) -> Result<()> {
        for dir in [
            &self.paths.processed_dir,
            &self.paths.logs_dir,
            &self.paths.models_dir,
        ] {
            fs::create_dir_all(dir)?;
            debug!("Ensured directory {:?}", dir);
        }
        Ok(())
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.data.image_size == 0 {
            return Err(Error::Config("data.image_size must be positive".to_string()));
        }
        if self.training.base_filters == 0 || self.training.hidden_size == 0 {
            return Err(Error::Config(
                "training.base_filters and training.hidden_size must be positive".to_string(),
            ));
        }
        if self.data.batch_size == 0 {
            return Err(Error::Config("data.batch_size must be positive".to_string()));
        }
        if !(0.0..1.0).contains(&self.training.dropout) {
            return Err(Error::Config(format!(
                "training.dropout must be in [0, 1), got {}",
                self.training.dropout
            )));
        }
        if self.training.lr_factor <= 0.0 || self.training.lr_factor >= 1.0 {
            return Err(Error::Config(format!(
                "training.lr_factor must be in (0, 1), got {}",
                self.training.lr_factor
            )));
        }
        Ok(())
    }
}

/// Timestamp run identifier, e.g. `20240131_154500`
pub fn generate_run_id() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config {}: {e}", path.display())))?;

    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse config {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_pipeline_constants() {
        let config = AppConfig::default();
        assert_eq!(config.data.image_size, 224);
        assert_eq!(config.data.resize_margin, 32);
        assert_eq!(config.data.batch_size, 32);
        assert_eq!(config.training.num_epochs, 30);
        assert_eq!(config.training.seed, 42);
        assert_eq!(config.training.hidden_size, 512);
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.run_id.len(), "20240101_000000".len());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("leafscan.toml");
        fs::write(
            &path,
            "run_id = \"exp1\"\n[training]\nnum_epochs = 3\n[data]\non_decode_error = \"placeholder\"\n",
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.run_id, "exp1");
        assert_eq!(config.training.num_epochs, 3);
        assert_eq!(config.training.learning_rate, 1e-4);
        assert_eq!(config.data.on_decode_error, DecodeFailurePolicy::Placeholder);
        assert_eq!(
            config.checkpoint_dir(),
            PathBuf::from("models/best_model_exp1")
        );
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[training\nnum_epochs = ").unwrap();

        let err = AppConfig::load(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_dropout() {
        let mut config = AppConfig::default();
        config.training.dropout = 1.5;
        assert!(config.validate().is_err());

        config.training.dropout = 0.2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_prepare_directories() {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.paths.processed_dir = dir.path().join("data/processed");
        config.paths.logs_dir = dir.path().join("logs");
        config.paths.models_dir = dir.path().join("models");

        config.prepare_directories().unwrap();
        assert!(config.paths.processed_dir.is_dir());
        assert!(config.paths.logs_dir.is_dir());
        assert!(config.paths.models_dir.is_dir());
    }
}
