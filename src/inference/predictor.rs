//! Inference Predictor Module
//!
//! Runs a trained [`Classifier`] on single images: decode → evaluation
//! transform → forward → softmax → top-k `(class_name, probability)`.

use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use image::{DynamicImage, ImageReader};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dataset::burn_dataset::images_to_tensor;
use crate::dataset::EvalTransform;
use crate::model::Classifier;
use crate::training::checkpoint::CheckpointBundle;
use crate::utils::error::{Error, Result};

/// One entry of a top-k list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub class_name: String,
    pub probability: f32,
}

/// Outcome for one path of a batch request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    Predictions(Vec<Prediction>),
    Error(String),
}

/// `{image_path, predictions}` or `{image_path, error}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub image_path: PathBuf,
    #[serde(flatten)]
    pub outcome: BatchOutcome,
}

impl BatchItemResult {
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, BatchOutcome::Predictions(_))
    }
}

/// The `k` most probable classes, most probable first.
///
/// `k` is clamped to the number of classes.
pub fn top_k(probabilities: &[f32], class_names: &[String], k: usize) -> Vec<Prediction> {
    let mut indexed: Vec<(usize, f32)> = probabilities.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));

    indexed
        .into_iter()
        .take(k.min(class_names.len()))
        .map(|(idx, probability)| Prediction {
            class_name: class_names
                .get(idx)
                .cloned()
                .unwrap_or_else(|| idx.to_string()),
            probability,
        })
        .collect()
}

/// Predictor for running inference with a trained model
pub struct Predictor<B: Backend> {
    model: Classifier<B>,
    class_names: Vec<String>,
    transform: EvalTransform,
    device: B::Device,
}

impl<B: Backend> std::fmt::Debug for Predictor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Predictor")
            .field("num_classes", &self.class_names.len())
            .field("image_size", &self.transform.image_size())
            .finish()
    }
}

impl<B: Backend> Predictor<B> {
    /// Load a checkpoint bundle; the input size comes from its metadata
    pub fn load(checkpoint_dir: &Path, resize_margin: usize, device: &B::Device) -> Result<Self> {
        let (model, _, metadata) = CheckpointBundle::new(checkpoint_dir).load_model::<B>(device)?;
        let transform = EvalTransform::new(metadata.image_size, resize_margin);
        Self::from_model(model, metadata.class_names, transform, device.clone())
    }

    pub fn from_model(
        model: Classifier<B>,
        class_names: Vec<String>,
        transform: EvalTransform,
        device: B::Device,
    ) -> Result<Self> {
        model.ensure_num_classes(class_names.len())?;
        Ok(Self {
            model,
            class_names,
            transform,
            device,
        })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn image_size(&self) -> usize {
        self.transform.image_size()
    }

    fn input(&self, image: &DynamicImage) -> burn::tensor::Tensor<B, 4> {
        let data = self.transform.apply(image);
        images_to_tensor::<B>(data, 1, self.image_size(), &self.device)
    }

    /// Softmax over all classes
    pub fn probabilities(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let probs = self.model.forward_softmax(self.input(image));
        probs
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| Error::Inference(format!("Failed to read probabilities: {:?}", e)))
    }

    pub fn predict_image(&self, image: &DynamicImage, k: usize) -> Result<Vec<Prediction>> {
        let probs = self.probabilities(image)?;
        Ok(top_k(&probs, &self.class_names, k))
    }

    /// Predict from encoded image bytes (format guessed from content)
    pub fn predict_bytes(&self, bytes: &[u8], k: usize) -> Result<Vec<Prediction>> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| Error::InvalidInput(format!("Cannot decode image: {}", e)))?;
        self.predict_image(&image, k)
    }

    pub fn predict_path(&self, path: &Path, k: usize) -> Result<Vec<Prediction>> {
        let image = open_image(path)?;
        self.predict_image(&image, k)
    }

    /// Pooled backbone features for one image
    pub fn extract_features(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        self.model
            .extract_features(self.input(image))
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| Error::Inference(format!("Failed to read features: {:?}", e)))
    }

    /// Predict each path in turn; a failing path yields an error entry, never an abort
    pub fn batch_predict<P: AsRef<Path>>(&self, paths: &[P], k: usize) -> Vec<BatchItemResult> {
        paths
            .iter()
            .map(|path| {
                let path = path.as_ref();
                let outcome = match self.predict_path(path, k) {
                    Ok(predictions) => BatchOutcome::Predictions(predictions),
                    Err(e) => {
                        warn!("Prediction failed for {:?}: {}", path, e);
                        BatchOutcome::Error(e.to_string())
                    }
                };
                BatchItemResult {
                    image_path: path.to_path_buf(),
                    outcome,
                }
            })
            .collect()
    }
}

fn open_image(path: &Path) -> Result<DynamicImage> {
    debug!("Decoding {:?}", path);
    ImageReader::open(path)
        .map_err(|e| Error::ImageLoad(path.to_path_buf(), e.to_string()))?
        .with_guessed_format()
        .map_err(|e| Error::ImageLoad(path.to_path_buf(), e.to_string()))?
        .decode()
        .map_err(|e| Error::ImageLoad(path.to_path_buf(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClassifierConfig;
    use burn_ndarray::NdArray;
    use image::{ImageBuffer, Rgb, RgbImage};
    use std::io::Cursor;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("class_{i}")).collect()
    }

    fn predictor(num_classes: usize) -> Predictor<TestBackend> {
        let device = Default::default();
        let model = ClassifierConfig::new(num_classes)
            .with_base_filters(2)
            .with_hidden_size(8)
            .init::<TestBackend>(&device);
        Predictor::from_model(model, names(num_classes), EvalTransform::new(16, 4), device).unwrap()
    }

    fn leaf() -> DynamicImage {
        let img: RgbImage = ImageBuffer::from_fn(24, 24, |x, y| Rgb([x as u8 * 9, 120, y as u8 * 9]));
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_top_k_sorted_and_clamped() {
        let probs = [0.1, 0.6, 0.3];
        let top = top_k(&probs, &names(3), 5);
        assert_eq!(top.len(), 3);
        assert_eq!(top[0].class_name, "class_1");
        assert_eq!(top[1].class_name, "class_2");
        assert!(top.windows(2).all(|w| w[0].probability >= w[1].probability));

        assert_eq!(top_k(&probs, &names(3), 1).len(), 1);
        assert!(top_k(&probs, &names(3), 0).is_empty());
    }

    #[test]
    fn test_predict_image_probabilities() {
        let predictor = predictor(7);
        let top = predictor.predict_image(&leaf(), 5).unwrap();

        assert_eq!(top.len(), 5);
        assert!(top.iter().all(|p| p.probability >= 0.0));
        assert!(top.windows(2).all(|w| w[0].probability >= w[1].probability));
        let sum: f32 = top.iter().map(|p| p.probability).sum();
        assert!(sum <= 1.0 + 1e-5);
    }

    #[test]
    fn test_predict_bytes_matches_image() {
        let predictor = predictor(3);
        let mut bytes = Vec::new();
        leaf().write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png).unwrap();

        let from_bytes = predictor.predict_bytes(&bytes, 3).unwrap();
        let from_image = predictor.predict_image(&leaf(), 3).unwrap();
        assert_eq!(from_bytes, from_image);

        assert!(matches!(
            predictor.predict_bytes(b"not an image", 3),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_extract_features_length() {
        let predictor = predictor(3);
        assert_eq!(predictor.extract_features(&leaf()).unwrap().len(), 16);
    }

    #[test]
    fn test_batch_predict_keeps_going_after_failure() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("leaf.png");
        leaf().save(&good).unwrap();
        let missing = dir.path().join("missing.jpg");

        let results = predictor(2).batch_predict(&[good.clone(), missing.clone()], 5);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(!results[1].is_ok());

        let json = serde_json::to_value(&results).unwrap();
        assert_eq!(json[0]["predictions"].as_array().unwrap().len(), 2);
        assert!(json[1]["error"].is_string());
        assert_eq!(json[1]["image_path"], missing.to_string_lossy().as_ref());
    }

    #[test]
    fn test_class_count_must_match_head() {
        let device = Default::default();
        let model = ClassifierConfig::new(3)
            .with_base_filters(2)
            .with_hidden_size(8)
            .init::<TestBackend>(&device);
        let result = Predictor::from_model(model, names(4), EvalTransform::new(16, 4), device);
        assert!(matches!(result, Err(Error::ClassMismatch { .. })));
    }
}
