//! Burn Dataset Integration
//!
//! [`ImageFolderDataset`] implements Burn's `Dataset` over an indexed image
//! folder. Retrieval decodes lazily and never hides a failure: every item is a
//! [`LoadOutcome`], and [`ImageBatcher`] decides per its
//! [`DecodeFailurePolicy`] whether a failed item is dropped or replaced by an
//! all-zero image. Either way the failure travels with the batch.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use image::{DynamicImage, ImageReader};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::warn;

use super::folder::{ClassIndex, ImageFolder, Sample};
use super::transforms::{EvalTransform, TrainTransform, Transform};
use super::DecodeFailurePolicy;
use crate::utils::error::Result;

/// A decoded image with its label
#[derive(Clone)]
pub struct ImageItem {
    /// Raw decoded image (not resized, not normalized)
    pub image: DynamicImage,
    pub label: usize,
    pub path: PathBuf,
}

impl std::fmt::Debug for ImageItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageItem")
            .field("label", &self.label)
            .field("path", &self.path)
            .field(
                "image_size",
                &format!("{}x{}", self.image.width(), self.image.height()),
            )
            .finish()
    }
}

/// A sample whose image could not be decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    pub path: PathBuf,
    pub label: usize,
    pub reason: String,
}

/// Result of retrieving one sample
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    Loaded(ImageItem),
    Failed(DecodeFailure),
}

impl LoadOutcome {
    /// Decode the image behind `path`
    pub fn load(path: &Path, label: usize) -> Self {
        let decoded = ImageReader::open(path)
            .map_err(|e| e.to_string())
            .and_then(|reader| reader.with_guessed_format().map_err(|e| e.to_string()))
            .and_then(|reader| reader.decode().map_err(|e| e.to_string()));

        match decoded {
            Ok(image) => LoadOutcome::Loaded(ImageItem {
                image,
                label,
                path: path.to_path_buf(),
            }),
            Err(reason) => LoadOutcome::Failed(DecodeFailure {
                path: path.to_path_buf(),
                label,
                reason,
            }),
        }
    }

    pub fn label(&self) -> usize {
        match self {
            LoadOutcome::Loaded(item) => item.label,
            LoadOutcome::Failed(failure) => failure.label,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            LoadOutcome::Loaded(item) => &item.path,
            LoadOutcome::Failed(failure) => &failure.path,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, LoadOutcome::Loaded(_))
    }
}

/// Lazily decoding dataset over an indexed image folder
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    samples: Vec<Sample>,
    classes: ClassIndex,
}

impl ImageFolderDataset {
    pub fn new(folder: ImageFolder) -> Self {
        Self {
            samples: folder.samples,
            classes: folder.classes,
        }
    }

    /// Index `root` and wrap it
    pub fn from_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        Ok(Self::new(ImageFolder::new(root)?))
    }

    pub fn classes(&self) -> &ClassIndex {
        &self.classes
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Samples per class count
    pub fn class_distribution(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.classes.len()];
        for sample in &self.samples {
            counts[sample.label] += 1;
        }
        counts
    }
}

impl Dataset<LoadOutcome> for ImageFolderDataset {
    fn get(&self, index: usize) -> Option<LoadOutcome> {
        let sample = self.samples.get(index)?;
        Some(LoadOutcome::load(&sample.path, sample.label))
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// A batch of images ready for the model
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// Images with shape [batch_size, 3, height, width]
    pub images: Tensor<B, 4>,
    /// Labels with shape [batch_size]
    pub targets: Tensor<B, 1, Int>,
    /// Items that failed to decode, whatever the policy did with them
    pub failures: Vec<DecodeFailure>,
}

impl<B: Backend> ImageBatch<B> {
    pub fn len(&self) -> usize {
        self.targets.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build an image tensor from normalized CHW buffers laid end to end
pub fn images_to_tensor<B: Backend>(
    data: Vec<f32>,
    batch_size: usize,
    image_size: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    Tensor::<B, 4>::from_floats(
        TensorData::new(data, [batch_size, 3, image_size, image_size]),
        device,
    )
}

/// Batcher that transforms decoded items in parallel
///
/// Each item gets its own RNG derived from the batcher seed and a running
/// batch counter, so parallel transformation stays reproducible.
pub struct ImageBatcher<B: Backend> {
    transform: Transform,
    policy: DecodeFailurePolicy,
    seed: u64,
    batches: Arc<AtomicU64>,
    _backend: std::marker::PhantomData<B>,
}

impl<B: Backend> Clone for ImageBatcher<B> {
    fn clone(&self) -> Self {
        Self {
            transform: self.transform.clone(),
            policy: self.policy,
            seed: self.seed,
            batches: self.batches.clone(),
            _backend: std::marker::PhantomData,
        }
    }
}

impl<B: Backend> std::fmt::Debug for ImageBatcher<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBatcher")
            .field("transform", &self.transform)
            .field("policy", &self.policy)
            .field("seed", &self.seed)
            .finish()
    }
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(transform: Transform, policy: DecodeFailurePolicy, seed: u64) -> Self {
        Self {
            transform,
            policy,
            seed,
            batches: Arc::new(AtomicU64::new(0)),
            _backend: std::marker::PhantomData,
        }
    }

    /// Deterministic batcher for validation, evaluation and inference
    pub fn eval(image_size: usize, resize_margin: usize, policy: DecodeFailurePolicy) -> Self {
        Self::new(
            EvalTransform::new(image_size, resize_margin).into(),
            policy,
            0,
        )
    }

    /// Augmenting batcher for training
    pub fn train(
        image_size: usize,
        resize_margin: usize,
        policy: DecodeFailurePolicy,
        seed: u64,
    ) -> Self {
        Self::new(
            TrainTransform::new(image_size, resize_margin).into(),
            policy,
            seed,
        )
    }

    pub fn image_size(&self) -> usize {
        self.transform.image_size()
    }
}

impl<B: Backend> Batcher<B, LoadOutcome, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<LoadOutcome>, device: &B::Device) -> ImageBatch<B> {
        let image_size = self.image_size();
        let item_len = 3 * image_size * image_size;

        let batch_index = self.batches.fetch_add(1, Ordering::Relaxed);
        let batch_seed = self
            .seed
            .wrapping_add(batch_index.wrapping_mul(0x9E37_79B9_7F4A_7C15));

        let processed: Vec<(Option<Vec<f32>>, usize, Option<DecodeFailure>)> = items
            .into_par_iter()
            .enumerate()
            .map(|(i, outcome)| match outcome {
                LoadOutcome::Loaded(item) => {
                    let mut rng = ChaCha8Rng::seed_from_u64(batch_seed.wrapping_add(i as u64));
                    (Some(self.transform.apply(&item.image, &mut rng)), item.label, None)
                }
                LoadOutcome::Failed(failure) => {
                    warn!("Failed to decode {:?}: {}", failure.path, failure.reason);
                    let placeholder = match self.policy {
                        DecodeFailurePolicy::Placeholder => Some(vec![0.0f32; item_len]),
                        DecodeFailurePolicy::Skip => None,
                    };
                    (placeholder, failure.label, Some(failure))
                }
            })
            .collect();

        let mut images_data = Vec::with_capacity(processed.len() * item_len);
        let mut targets_data = Vec::with_capacity(processed.len());
        let mut failures = Vec::new();

        for (data, label, failure) in processed {
            if let Some(data) = data {
                images_data.extend(data);
                targets_data.push(label as i64);
            }
            failures.extend(failure);
        }

        let batch_size = targets_data.len();
        let images = images_to_tensor::<B>(images_data, batch_size, image_size, device);
        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device);

        ImageBatch {
            images,
            targets,
            failures,
        }
    }
}
