//! Application state shared across handlers

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use leafscan::backend::{default_device, InferenceBackend};
use leafscan::inference::{BatchItemResult, Prediction, Predictor};
use leafscan::{Error, Result};
use tokio::sync::OnceCell;
use tracing::info;

type SharedPredictor = Arc<Mutex<Predictor<InferenceBackend>>>;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Checkpoint directory to serve
    pub checkpoint_dir: PathBuf,
    pub resize_margin: usize,
    /// Top-k used when a request does not ask for one
    pub top_k: usize,
}

/// Loads the classifier once and runs predictions off the async runtime
pub struct ClassifierService {
    config: ServerConfig,
    predictor: OnceCell<SharedPredictor>,
}

impl ClassifierService {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            predictor: OnceCell::new(),
        }
    }

    /// Service around an already constructed predictor
    pub fn with_predictor(config: ServerConfig, predictor: Predictor<InferenceBackend>) -> Self {
        Self {
            config,
            predictor: OnceCell::new_with(Some(Arc::new(Mutex::new(predictor)))),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn is_loaded(&self) -> bool {
        self.predictor.initialized()
    }

    /// Load the checkpoint on first use; concurrent callers share one load
    pub async fn predictor(&self) -> Result<SharedPredictor> {
        self.predictor
            .get_or_try_init(|| async {
                let dir = self.config.checkpoint_dir.clone();
                let margin = self.config.resize_margin;
                info!("Loading model from {:?}", dir);

                let predictor = tokio::task::spawn_blocking(move || {
                    Predictor::<InferenceBackend>::load(&dir, margin, &default_device())
                })
                .await
                .map_err(|e| Error::Inference(format!("Model loading task failed: {}", e)))??;

                info!("Model loaded ({} classes)", predictor.num_classes());
                Ok::<_, Error>(Arc::new(Mutex::new(predictor)))
            })
            .await
            .cloned()
    }

    async fn run<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Predictor<InferenceBackend>) -> T + Send + 'static,
    {
        let predictor = self.predictor().await?;
        tokio::task::spawn_blocking(move || {
            let guard = predictor
                .lock()
                .map_err(|_| Error::Inference("Predictor lock poisoned".to_string()))?;
            Ok(job(&guard))
        })
        .await
        .map_err(|e| Error::Inference(format!("Prediction task failed: {}", e)))?
    }

    pub async fn predict_bytes(&self, bytes: Vec<u8>, top_k: usize) -> Result<Vec<Prediction>> {
        self.run(move |p| p.predict_bytes(&bytes, top_k)).await?
    }

    pub async fn batch_predict(&self, paths: Vec<PathBuf>, top_k: usize) -> Result<Vec<BatchItemResult>> {
        self.run(move |p| p.batch_predict(&paths, top_k)).await
    }
}

/// Shared application state
pub struct AppState {
    pub service: ClassifierService,
}

impl AppState {
    pub fn new(service: ClassifierService) -> Self {
        Self { service }
    }
}

pub type SharedState = Arc<AppState>;
