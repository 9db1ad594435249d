//! Image validation and cleaning.
//!
//! Walks a raw image tree, rejects files that are corrupt, too small or not
//! three-channel, and re-encodes the survivors as JPEG into a mirrored tree.
//! A bad file never aborts the sweep: it is logged and counted as a skip.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Cursor};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, ImageReader};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::has_image_extension;
use crate::utils::error::Result;

/// Minimum accepted width and height in pixels
pub const MIN_IMAGE_SIDE: u32 = 32;

/// JPEG quality used for re-encoded images
pub const CLEAN_JPEG_QUALITY: u8 = 95;

/// Split directories cleaned by [`clean_splits`]
pub const SPLITS: [&str; 3] = ["train", "val", "test"];

/// Why an image was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Rejection {
    /// The file could not be opened or decoded
    Unreadable(String),
    /// Decoded fine, but the container format is not allowed
    UnsupportedFormat(String),
    /// Not a three-channel color image
    ChannelCount(u8),
    /// One of the sides is below the minimum
    TooSmall { width: u32, height: u32 },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Unreadable(reason) => write!(f, "unreadable: {}", reason),
            Rejection::UnsupportedFormat(format) => write!(f, "unsupported format {}", format),
            Rejection::ChannelCount(channels) => write!(f, "expected 3 channels, found {}", channels),
            Rejection::TooSmall { width, height } => {
                write!(f, "too small: {}x{} (minimum {}px)", width, height, MIN_IMAGE_SIDE)
            }
        }
    }
}

/// Structural checks applied to every candidate image
#[derive(Debug, Clone)]
pub struct ImageValidator {
    pub min_width: u32,
    pub min_height: u32,
    pub allowed_formats: Vec<ImageFormat>,
}

impl Default for ImageValidator {
    fn default() -> Self {
        Self {
            min_width: MIN_IMAGE_SIDE,
            min_height: MIN_IMAGE_SIDE,
            allowed_formats: vec![ImageFormat::Jpeg, ImageFormat::Png],
        }
    }
}

impl ImageValidator {
    /// Open, fully decode and check an image file.
    ///
    /// The format is detected from the file contents, falling back to the
    /// extension when the signature is not recognized. The channel rule is
    /// applied to the stored color model, so palette PNGs and CMYK JPEGs are
    /// rejected even though the decoder expands them to RGB.
    pub fn validate(&self, path: &Path) -> std::result::Result<DynamicImage, Rejection> {
        let bytes = fs::read(path).map_err(|e| Rejection::Unreadable(e.to_string()))?;
        let mut reader = ImageReader::new(Cursor::new(bytes.as_slice()));
        if let Ok(format) = ImageFormat::from_path(path) {
            reader.set_format(format);
        }
        let reader = reader
            .with_guessed_format()
            .map_err(|e| Rejection::Unreadable(e.to_string()))?;

        let format = match reader.format() {
            Some(format) if self.allowed_formats.contains(&format) => format,
            Some(format) => return Err(Rejection::UnsupportedFormat(format!("{:?}", format))),
            None => return Err(Rejection::UnsupportedFormat("unknown".to_string())),
        };

        let image = reader
            .decode()
            .map_err(|e| Rejection::Unreadable(e.to_string()))?;

        if let Some(channels) = stored_channels(&bytes, format) {
            if channels != 3 {
                return Err(Rejection::ChannelCount(channels));
            }
        }

        self.check(&image)?;
        Ok(image)
    }

    /// Channel and size checks on an already decoded image
    pub fn check(&self, image: &DynamicImage) -> std::result::Result<(), Rejection> {
        let channels = image.color().channel_count();
        if channels != 3 {
            return Err(Rejection::ChannelCount(channels));
        }

        if image.width() < self.min_width || image.height() < self.min_height {
            return Err(Rejection::TooSmall {
                width: image.width(),
                height: image.height(),
            });
        }

        Ok(())
    }
}

/// Channel count of the color model stored in the file header.
///
/// PNG reads the IHDR color type (palette images count as one channel), JPEG
/// reads the component count of the first frame header. `None` for other
/// formats or when the header is not where it should be.
pub fn stored_channels(bytes: &[u8], format: ImageFormat) -> Option<u8> {
    match format {
        ImageFormat::Png => png_channels(bytes),
        ImageFormat::Jpeg => jpeg_components(bytes),
        _ => None,
    }
}

fn png_channels(bytes: &[u8]) -> Option<u8> {
    // 8-byte signature, then IHDR: length, tag, width, height, depth, color type
    if bytes.get(12..16)? != b"IHDR" {
        return None;
    }
    match bytes.get(25)? {
        0 | 3 => Some(1),
        4 => Some(2),
        2 => Some(3),
        6 => Some(4),
        _ => None,
    }
}

fn jpeg_components(bytes: &[u8]) -> Option<u8> {
    if bytes.get(0..2)? != [0xFF, 0xD8] {
        return None;
    }

    let mut pos = 2;
    loop {
        if *bytes.get(pos)? != 0xFF {
            return None;
        }
        let marker = *bytes.get(pos + 1)?;
        match marker {
            // fill byte
            0xFF => pos += 1,
            // markers without a length field
            0x01 | 0xD0..=0xD7 => pos += 2,
            // SOF0..SOF15 except DHT, JPG and DAC
            0xC0..=0xCF if !matches!(marker, 0xC4 | 0xC8 | 0xCC) => {
                // length(2) precision(1) height(2) width(2) components(1)
                return bytes.get(pos + 9).copied();
            }
            // start of scan or end of image before any frame header
            0xDA | 0xD9 => return None,
            _ => {
                let len = u16::from_be_bytes([*bytes.get(pos + 2)?, *bytes.get(pos + 3)?]) as usize;
                pos += 2 + len;
            }
        }
    }
}

/// A file the cleaner did not write
#[derive(Debug, Clone, Serialize)]
pub struct SkippedImage {
    pub path: PathBuf,
    pub reason: String,
}

/// Written/skipped counts for one directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DirTally {
    pub written: usize,
    pub skipped: usize,
}

/// Outcome of a cleaning sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanReport {
    pub written: usize,
    pub skipped: Vec<SkippedImage>,
    /// Counts keyed by directory relative to the input root ("." for the root)
    pub per_dir: BTreeMap<String, DirTally>,
}

impl CleanReport {
    pub fn written_in(&self, dir: &str) -> usize {
        self.per_dir.get(dir).map(|t| t.written).unwrap_or(0)
    }

    pub fn skipped_in(&self, dir: &str) -> usize {
        self.per_dir.get(dir).map(|t| t.skipped).unwrap_or(0)
    }

    fn record_written(&mut self, dir: &str) {
        self.written += 1;
        self.per_dir.entry(dir.to_string()).or_default().written += 1;
    }

    fn record_skipped(&mut self, dir: &str, path: &Path, reason: String) {
        self.per_dir.entry(dir.to_string()).or_default().skipped += 1;
        self.skipped.push(SkippedImage {
            path: path.to_path_buf(),
            reason,
        });
    }
}

/// Validates and re-encodes an image tree
#[derive(Debug, Clone)]
pub struct Cleaner {
    validator: ImageValidator,
    jpeg_quality: u8,
    show_progress: bool,
}

impl Default for Cleaner {
    fn default() -> Self {
        Self {
            validator: ImageValidator::default(),
            jpeg_quality: CLEAN_JPEG_QUALITY,
            show_progress: false,
        }
    }
}

impl Cleaner {
    pub fn new(validator: ImageValidator) -> Self {
        Self {
            validator,
            ..Self::default()
        }
    }

    /// Show an indicatif progress bar while cleaning
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Clean every image under `input_dir` into the same relative location under `output_dir`
    pub fn clean_dir(&self, input_dir: &Path, output_dir: &Path) -> Result<CleanReport> {
        fs::create_dir_all(output_dir)?;

        let candidates: Vec<PathBuf> = WalkDir::new(input_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping unreadable directory entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file() && has_image_extension(entry.path()))
            .map(|entry| entry.into_path())
            .collect();

        info!(
            "Cleaning {} candidate images from {:?} into {:?}",
            candidates.len(),
            input_dir,
            output_dir
        );

        let progress = self.progress_bar(candidates.len() as u64);
        let mut report = CleanReport::default();

        for path in &candidates {
            let relative_dir = path
                .parent()
                .and_then(|parent| parent.strip_prefix(input_dir).ok())
                .map(Path::to_path_buf)
                .unwrap_or_default();
            let dir_key = dir_key(&relative_dir);

            match self.clean_file(path, &output_dir.join(&relative_dir)) {
                Ok(target) => {
                    debug!("Cleaned {:?} -> {:?}", path, target);
                    report.record_written(&dir_key);
                }
                Err(reason) => {
                    warn!("Skipping {:?}: {}", path, reason);
                    report.record_skipped(&dir_key, path, reason);
                }
            }
            progress.inc(1);
        }

        progress.finish_and_clear();
        info!(
            "Cleaned {:?}: {} written, {} skipped",
            input_dir,
            report.written,
            report.skipped.len()
        );

        Ok(report)
    }

    /// Validate one file and write its RGB JPEG copy into `target_dir`
    fn clean_file(&self, path: &Path, target_dir: &Path) -> std::result::Result<PathBuf, String> {
        let image = self.validator.validate(path).map_err(|r| r.to_string())?;

        let file_name = path
            .file_name()
            .ok_or_else(|| "path has no file name".to_string())?;
        fs::create_dir_all(target_dir).map_err(|e| format!("failed to create {:?}: {}", target_dir, e))?;
        let target = target_dir.join(file_name);

        let file = File::create(&target).map_err(|e| format!("failed to create {:?}: {}", target, e))?;
        let encoder = JpegEncoder::new_with_quality(BufWriter::new(file), self.jpeg_quality);
        DynamicImage::ImageRgb8(image.to_rgb8())
            .write_with_encoder(encoder)
            .map_err(|e| format!("failed to encode {:?}: {}", target, e))?;

        Ok(target)
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(len);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    }
}

fn dir_key(relative_dir: &Path) -> String {
    if relative_dir.as_os_str().is_empty() {
        ".".to_string()
    } else {
        relative_dir
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Clean `train`, `val` and `test` under `raw_root` into the same names under `processed_root`.
///
/// Missing splits are skipped with a warning.
pub fn clean_splits(
    cleaner: &Cleaner,
    raw_root: &Path,
    processed_root: &Path,
) -> Result<Vec<(String, CleanReport)>> {
    let mut reports = Vec::new();

    for split in SPLITS {
        let input = raw_root.join(split);
        if !input.is_dir() {
            warn!("Split directory {:?} not found, skipping", input);
            continue;
        }

        info!("Cleaning {} images...", split);
        let report = cleaner.clean_dir(&input, &processed_root.join(split))?;
        reports.push((split.to_string(), report));
    }

    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageBuffer, Luma, LumaA, Rgb, RgbImage, Rgba, RgbaImage};
    use tempfile::TempDir;

    fn write_rgb(path: &Path, width: u32, height: u32) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let img: RgbImage = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, 90])
        });
        img.save(path).unwrap();
    }

    fn write_corrupt(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"definitely not a jpeg").unwrap();
    }

    #[test]
    fn test_accepts_exactly_minimum_rgb() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("edge.png");
        write_rgb(&path, 32, 32);

        let validator = ImageValidator::default();
        assert!(validator.validate(&path).is_ok());
    }

    #[test]
    fn test_rejects_too_small() {
        let dir = TempDir::new().unwrap();
        let narrow = dir.path().join("narrow.png");
        let short = dir.path().join("short.jpg");
        write_rgb(&narrow, 31, 64);
        write_rgb(&short, 64, 31);

        let validator = ImageValidator::default();
        assert_eq!(
            validator.validate(&narrow).unwrap_err(),
            Rejection::TooSmall { width: 31, height: 64 }
        );
        assert!(matches!(
            validator.validate(&short),
            Err(Rejection::TooSmall { .. })
        ));
    }

    #[test]
    fn test_rejects_non_rgb() {
        let dir = TempDir::new().unwrap();

        let gray_path = dir.path().join("gray.png");
        let gray: GrayImage = ImageBuffer::from_fn(64, 64, |x, _| Luma([x as u8]));
        gray.save(&gray_path).unwrap();

        let rgba_path = dir.path().join("alpha.png");
        let rgba: RgbaImage = ImageBuffer::from_fn(64, 64, |x, y| Rgba([x as u8, y as u8, 0, 255]));
        rgba.save(&rgba_path).unwrap();

        let validator = ImageValidator::default();
        assert_eq!(validator.validate(&gray_path).unwrap_err(), Rejection::ChannelCount(1));
        assert_eq!(validator.validate(&rgba_path).unwrap_err(), Rejection::ChannelCount(4));
    }

    #[test]
    fn test_rejects_palette_and_gray_alpha_png() {
        let dir = TempDir::new().unwrap();

        // Two-color palette: decodes to RGB but is stored single-channel
        let palette_path = dir.path().join("palette.png");
        let file = File::create(&palette_path).unwrap();
        let mut encoder = png::Encoder::new(BufWriter::new(file), 64, 64);
        encoder.set_color(png::ColorType::Indexed);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_palette(vec![0u8, 128, 0, 200, 40, 40]);
        let mut writer = encoder.write_header().unwrap();
        let indices: Vec<u8> = (0..64 * 64).map(|i| (i % 2) as u8).collect();
        writer.write_image_data(&indices).unwrap();
        writer.finish().unwrap();

        let la_path = dir.path().join("gray_alpha.png");
        let la: ImageBuffer<LumaA<u8>, Vec<u8>> = ImageBuffer::from_fn(64, 64, |x, _| LumaA([x as u8, 255]));
        la.save(&la_path).unwrap();

        let validator = ImageValidator::default();
        assert_eq!(validator.validate(&palette_path).unwrap_err(), Rejection::ChannelCount(1));
        assert_eq!(validator.validate(&la_path).unwrap_err(), Rejection::ChannelCount(2));
    }

    #[test]
    fn test_stored_channels_reads_headers() {
        let dir = TempDir::new().unwrap();
        let rgb_png = dir.path().join("rgb.png");
        let rgb_jpg = dir.path().join("rgb.jpg");
        write_rgb(&rgb_png, 40, 40);
        write_rgb(&rgb_jpg, 40, 40);

        assert_eq!(stored_channels(&fs::read(&rgb_png).unwrap(), ImageFormat::Png), Some(3));
        assert_eq!(stored_channels(&fs::read(&rgb_jpg).unwrap(), ImageFormat::Jpeg), Some(3));

        // SOI, an APP14 segment, then a baseline frame header with four components (CMYK)
        let cmyk = [
            0xFF, 0xD8, 0xFF, 0xEE, 0x00, 0x04, 0x00, 0x00, 0xFF, 0xC0, 0x00, 0x14, 0x08, 0x00, 0x40, 0x00,
            0x40, 0x04,
        ];
        assert_eq!(stored_channels(&cmyk, ImageFormat::Jpeg), Some(4));
        assert_eq!(stored_channels(b"not an image", ImageFormat::Png), None);
    }

    #[test]
    fn test_rejects_disallowed_format() {
        let dir = TempDir::new().unwrap();
        let bmp = dir.path().join("leaf.bmp");
        write_rgb(&bmp, 64, 64);
        // Same bytes behind an allowed extension: content sniffing still sees BMP
        let disguised = dir.path().join("leaf.png");
        fs::copy(&bmp, &disguised).unwrap();

        let validator = ImageValidator::default();
        assert!(matches!(
            validator.validate(&disguised),
            Err(Rejection::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_rejects_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.jpg");
        write_corrupt(&path);

        let validator = ImageValidator::default();
        assert!(matches!(validator.validate(&path), Err(Rejection::Unreadable(_))));
    }

    #[test]
    fn test_clean_dir_mirrors_tree_and_counts_skips() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("data/train");
        let processed = dir.path().join("data/processed/train");

        for class in ["cat", "dog"] {
            for i in 0..10 {
                let ext = if i % 2 == 0 { "png" } else { "jpg" };
                write_rgb(&raw.join(class).join(format!("img_{i}.{ext}")), 48, 40);
            }
            write_corrupt(&raw.join(class).join("corrupt_0.jpg"));
            write_corrupt(&raw.join(class).join("corrupt_1.png"));
        }
        // Not an image extension: ignored entirely
        fs::write(raw.join("cat").join("notes.txt"), "ignore me").unwrap();

        let report = Cleaner::default().clean_dir(&raw, &processed).unwrap();

        assert_eq!(report.written, 20);
        assert_eq!(report.skipped.len(), 4);
        for class in ["cat", "dog"] {
            assert_eq!(report.written_in(class), 10);
            assert_eq!(report.skipped_in(class), 2);

            let outputs: Vec<_> = fs::read_dir(processed.join(class)).unwrap().collect();
            assert_eq!(outputs.len(), 10);
        }
        assert!(!processed.join("cat").join("corrupt_0.jpg").exists());
    }

    #[test]
    fn test_cleaned_files_are_rgb_jpeg() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("raw");
        let out = dir.path().join("out");
        write_rgb(&raw.join("leaf").join("sample.png"), 40, 40);

        Cleaner::default().clean_dir(&raw, &out).unwrap();

        let cleaned = out.join("leaf").join("sample.png");
        let reader = ImageReader::open(&cleaned)
            .unwrap()
            .with_guessed_format()
            .unwrap();
        assert_eq!(reader.format(), Some(ImageFormat::Jpeg));
        let img = reader.decode().unwrap();
        assert_eq!(img.color().channel_count(), 3);
        assert_eq!((img.width(), img.height()), (40, 40));
    }

    #[test]
    fn test_clean_splits_skips_missing() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("data");
        write_rgb(&raw.join("train").join("a").join("1.png"), 32, 32);
        write_rgb(&raw.join("test").join("a").join("1.png"), 32, 32);

        let reports = clean_splits(&Cleaner::default(), &raw, &dir.path().join("processed")).unwrap();
        let names: Vec<_> = reports.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["train", "test"]);
        assert!(dir.path().join("processed/test/a/1.png").exists());
    }
}
