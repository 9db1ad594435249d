//! Dataset Module
//!
//! Everything between raw image files and batched tensors:
//!
//! - `cleaner`: validate raw images and re-encode survivors into a mirrored tree
//! - `folder`: class-per-directory indexing and the class index
//! - `transforms`: deterministic evaluation and randomized training transforms
//! - `burn_dataset`: Burn `Dataset`/`Batcher` integration with explicit decode outcomes

pub mod burn_dataset;
pub mod cleaner;
pub mod folder;
pub mod transforms;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use burn_dataset::{
    DecodeFailure, ImageBatch, ImageBatcher, ImageFolderDataset, ImageItem, LoadOutcome,
};
pub use cleaner::{CleanReport, ImageValidator, Rejection};
pub use folder::{ClassIndex, DatasetStats, ImageFolder, Sample};
pub use transforms::{EvalTransform, TrainTransform, Transform};

/// File extensions treated as images when indexing and cleaning
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Check a path's extension against [`IMAGE_EXTENSIONS`] (case-insensitive)
pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// How a consumer handles a sample whose image failed to decode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeFailurePolicy {
    /// Drop the sample from the batch
    #[default]
    Skip,
    /// Keep the label and substitute an all-zero tensor
    Placeholder,
}

impl std::str::FromStr for DecodeFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "placeholder" => Ok(Self::Placeholder),
            other => Err(format!("unknown decode failure policy '{other}' (expected skip or placeholder)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_has_image_extension() {
        assert!(has_image_extension(&PathBuf::from("a/b/leaf.JPG")));
        assert!(has_image_extension(&PathBuf::from("leaf.jpeg")));
        assert!(has_image_extension(&PathBuf::from("leaf.png")));
        assert!(!has_image_extension(&PathBuf::from("leaf.bmp")));
        assert!(!has_image_extension(&PathBuf::from("README")));
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("Skip".parse::<DecodeFailurePolicy>().unwrap(), DecodeFailurePolicy::Skip);
        assert_eq!(
            "placeholder".parse::<DecodeFailurePolicy>().unwrap(),
            DecodeFailurePolicy::Placeholder
        );
        assert!("zero".parse::<DecodeFailurePolicy>().is_err());
    }
}
