//! Class-per-directory image folder indexing
//!
//! ```text
//! root/
//! ├── cat/
//! │   ├── 001.jpg
//! │   └── 002.png
//! └── dog/
//!     └── ...
//! ```
//!
//! Class labels follow the lexicographic order of the subdirectory names, so
//! indexing the same tree twice always yields the same mapping.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::has_image_extension;
use crate::utils::error::{Error, Result};

/// A single indexed image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub path: PathBuf,
    pub label: usize,
    pub class_name: String,
}

/// Sorted class names mapped to dense integer labels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct ClassIndex {
    names: Vec<String>,
    lookup: HashMap<String, usize>,
}

impl From<Vec<String>> for ClassIndex {
    fn from(names: Vec<String>) -> Self {
        Self::from_ordered(names)
    }
}

impl From<ClassIndex> for Vec<String> {
    fn from(index: ClassIndex) -> Self {
        index.names
    }
}

impl ClassIndex {
    /// Build an index from class names; they are sorted and deduplicated
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();
        Self::from_ordered(names)
    }

    /// Build an index keeping the given order (e.g. the list stored in a checkpoint)
    pub fn from_ordered(names: Vec<String>) -> Self {
        let lookup = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();
        Self { names, lookup }
    }

    /// Discover class directories directly under `root`
    pub fn scan(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::PathNotFound(root.to_path_buf()));
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        Ok(Self::new(names))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, idx: usize) -> Option<&str> {
        self.names.get(idx).map(String::as_str)
    }

    pub fn index(&self, name: &str) -> Option<usize> {
        self.lookup.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Fail unless `other` lists the same classes in the same order
    pub fn ensure_matches(&self, other: &[String], context: &str) -> Result<()> {
        if self.names.len() != other.len() {
            return Err(Error::ClassMismatch {
                expected: other.len(),
                found: self.names.len(),
                context: context.to_string(),
            });
        }

        if let Some((idx, (ours, theirs))) = self
            .names
            .iter()
            .zip(other)
            .enumerate()
            .find(|(_, (a, b))| a != b)
        {
            return Err(Error::Dataset(format!(
                "{}: class {} is '{}' but expected '{}'",
                context, idx, ours, theirs
            )));
        }

        Ok(())
    }
}

/// An indexed image folder
#[derive(Debug, Clone)]
pub struct ImageFolder {
    pub root: PathBuf,
    pub classes: ClassIndex,
    pub samples: Vec<Sample>,
}

impl ImageFolder {
    /// Index every image file under each class directory of `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        info!("Indexing image folder {:?}", root);

        let classes = ClassIndex::scan(&root)?;
        if classes.is_empty() {
            return Err(Error::Dataset(format!(
                "no class directories found under {:?}",
                root
            )));
        }

        let mut samples = Vec::new();
        for (label, class_name) in classes.names().iter().enumerate() {
            let before = samples.len();

            for entry in WalkDir::new(root.join(class_name))
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if entry.file_type().is_file() && has_image_extension(entry.path()) {
                    samples.push(Sample {
                        path: entry.into_path(),
                        label,
                        class_name: class_name.clone(),
                    });
                }
            }

            debug!(
                "Class '{}' (label {}): {} samples",
                class_name,
                label,
                samples.len() - before
            );
        }

        info!(
            "Indexed {} samples across {} classes",
            samples.len(),
            classes.len()
        );

        Ok(Self {
            root,
            classes,
            samples,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Number of samples per label, indexed by label
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.classes.len()];
        for sample in &self.samples {
            counts[sample.label] += 1;
        }
        counts
    }

    pub fn stats(&self) -> DatasetStats {
        DatasetStats {
            root: self.root.clone(),
            total: self.samples.len(),
            per_class: self
                .classes
                .names()
                .iter()
                .cloned()
                .zip(self.class_counts())
                .collect(),
        }
    }
}

/// Per-class sample counts
#[derive(Debug, Clone, Serialize)]
pub struct DatasetStats {
    pub root: PathBuf,
    pub total: usize,
    pub per_class: Vec<(String, usize)>,
}

impl DatasetStats {
    pub fn min_class(&self) -> Option<&(String, usize)> {
        self.per_class.iter().min_by_key(|(_, n)| *n)
    }

    pub fn max_class(&self) -> Option<&(String, usize)> {
        self.per_class.iter().max_by_key(|(_, n)| *n)
    }
}

impl fmt::Display for DatasetStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Dataset: {}", self.root.display())?;
        writeln!(f, "  Classes: {}", self.per_class.len())?;
        writeln!(f, "  Samples: {}", self.total)?;
        let width = self
            .per_class
            .iter()
            .map(|(name, _)| name.len())
            .max()
            .unwrap_or(0);
        for (name, count) in &self.per_class {
            writeln!(f, "    {:<width$}  {:>6}", name, count, width = width)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, RgbImage};
    use tempfile::TempDir;

    fn make_tree(root: &Path, classes: &[(&str, usize)]) {
        for (class, count) in classes {
            let dir = root.join(class);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..*count {
                let img: RgbImage = ImageBuffer::from_fn(8, 8, |_, _| Rgb([10, 20, 30]));
                img.save(dir.join(format!("{i:03}.png"))).unwrap();
            }
        }
    }

    #[test]
    fn test_labels_follow_sorted_directory_names() {
        let dir = TempDir::new().unwrap();
        make_tree(dir.path(), &[("tomato", 2), ("apple", 3), ("corn", 1)]);
        fs::write(dir.path().join("apple").join("README.txt"), "x").unwrap();

        let folder = ImageFolder::new(dir.path()).unwrap();
        assert_eq!(folder.classes.names(), &["apple", "corn", "tomato"]);
        assert_eq!(folder.len(), 6);
        assert_eq!(folder.class_counts(), vec![3, 1, 2]);
        assert!(folder
            .samples
            .iter()
            .all(|s| folder.classes.index(&s.class_name) == Some(s.label)));
    }

    #[test]
    fn test_index_is_stable_across_scans() {
        let dir = TempDir::new().unwrap();
        make_tree(dir.path(), &[("b", 2), ("a", 2), ("c", 2)]);

        let first = ImageFolder::new(dir.path()).unwrap();
        let second = ImageFolder::new(dir.path()).unwrap();
        assert_eq!(first.classes, second.classes);
        assert_eq!(first.samples, second.samples);
    }

    #[test]
    fn test_missing_root() {
        let dir = TempDir::new().unwrap();
        let err = ImageFolder::new(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::PathNotFound(_)));
    }

    #[test]
    fn test_ensure_matches() {
        let index = ClassIndex::new(["dog", "cat"]);
        assert_eq!(index.name(0), Some("cat"));

        let same = vec!["cat".to_string(), "dog".to_string()];
        assert!(index.ensure_matches(&same, "checkpoint").is_ok());

        let shorter = vec!["cat".to_string()];
        assert!(matches!(
            index.ensure_matches(&shorter, "checkpoint"),
            Err(Error::ClassMismatch { expected: 1, found: 2, .. })
        ));

        let reordered = vec!["dog".to_string(), "cat".to_string()];
        assert!(index.ensure_matches(&reordered, "checkpoint").is_err());
    }

    #[test]
    fn test_class_index_serializes_as_list() {
        let index = ClassIndex::new(["leaf_rust", "healthy"]);
        let json = serde_json::to_string(&index).unwrap();
        assert_eq!(json, r#"["healthy","leaf_rust"]"#);
        let restored: ClassIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.index("leaf_rust"), Some(1));
        assert_eq!(restored, index);
    }

    #[test]
    fn test_stats_display() {
        let dir = TempDir::new().unwrap();
        make_tree(dir.path(), &[("healthy", 3), ("rust", 1)]);

        let stats = ImageFolder::new(dir.path()).unwrap().stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.min_class().unwrap().0, "rust");
        assert_eq!(stats.max_class().unwrap().0, "healthy");
        assert!(stats.to_string().contains("Classes: 2"));
    }
}
