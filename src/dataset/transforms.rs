//! Image transforms
//!
//! Both transforms end in the same place: a `(3, size, size)` CHW float buffer
//! scaled to `[0, 1]` and normalized with the ImageNet channel statistics.
//!
//! - [`EvalTransform`]: resize to `size + margin`, center crop. Deterministic,
//!   used for validation, evaluation and serving.
//! - [`TrainTransform`]: resize, random resized crop, horizontal flip,
//!   rotation and color jitter, driven by a caller-provided RNG.

use image::imageops::FilterType;
use image::{DynamicImage, ImageBuffer, Rgb, RgbImage};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// ImageNet per-channel mean (RGB)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet per-channel standard deviation (RGB)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Attempts at sampling a valid random crop before falling back to a center crop
const CROP_ATTEMPTS: usize = 10;

/// Convert an RGB image to a normalized CHW buffer
pub fn to_normalized_chw(rgb: &RgbImage) -> Vec<f32> {
    let (width, height) = rgb.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let offset = (y * width + x) as usize;
        for c in 0..3 {
            data[c * plane + offset] = (pixel[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }

    data
}

/// Deterministic resize + center crop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalTransform {
    image_size: u32,
    resize_margin: u32,
}

impl Default for EvalTransform {
    fn default() -> Self {
        Self::new(crate::IMAGE_SIZE, crate::RESIZE_MARGIN)
    }
}

impl EvalTransform {
    pub fn new(image_size: usize, resize_margin: usize) -> Self {
        Self {
            image_size: image_size as u32,
            resize_margin: resize_margin as u32,
        }
    }

    pub fn image_size(&self) -> usize {
        self.image_size as usize
    }

    /// Resized and cropped image, before tensor conversion
    pub fn prepare(&self, img: &DynamicImage) -> RgbImage {
        let resized = resize_square(img, self.image_size + self.resize_margin);
        let offset = self.resize_margin / 2;
        resized
            .crop_imm(offset, offset, self.image_size, self.image_size)
            .to_rgb8()
    }

    pub fn apply(&self, img: &DynamicImage) -> Vec<f32> {
        to_normalized_chw(&self.prepare(img))
    }
}

/// Randomization ranges of the training transform
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentationConfig {
    /// Crop area as a fraction of the resized image
    pub crop_scale: (f32, f32),
    /// Crop aspect ratio (width / height)
    pub crop_ratio: (f32, f32),
    pub horizontal_flip_prob: f32,
    /// Rotation is uniform in `±rotation_degrees`
    pub rotation_degrees: f32,
    /// Brightness, contrast and saturation factors are uniform in `1 ± delta`
    pub brightness_delta: f32,
    pub contrast_delta: f32,
    pub saturation_delta: f32,
    /// Hue shift is uniform in `±hue_delta` turns
    pub hue_delta: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            crop_scale: (0.08, 1.0),
            crop_ratio: (3.0 / 4.0, 4.0 / 3.0),
            horizontal_flip_prob: 0.5,
            rotation_degrees: 15.0,
            brightness_delta: 0.1,
            contrast_delta: 0.1,
            saturation_delta: 0.1,
            hue_delta: 0.05,
        }
    }
}

/// Randomized training transform
#[derive(Debug, Clone, PartialEq)]
pub struct TrainTransform {
    image_size: u32,
    resize_margin: u32,
    config: AugmentationConfig,
}

impl Default for TrainTransform {
    fn default() -> Self {
        Self::new(crate::IMAGE_SIZE, crate::RESIZE_MARGIN)
    }
}

impl TrainTransform {
    pub fn new(image_size: usize, resize_margin: usize) -> Self {
        Self::with_config(image_size, resize_margin, AugmentationConfig::default())
    }

    pub fn with_config(image_size: usize, resize_margin: usize, config: AugmentationConfig) -> Self {
        Self {
            image_size: image_size as u32,
            resize_margin: resize_margin as u32,
            config,
        }
    }

    pub fn image_size(&self) -> usize {
        self.image_size as usize
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    /// Augmented image, before tensor conversion
    pub fn augment(&self, img: &DynamicImage, rng: &mut ChaCha8Rng) -> RgbImage {
        let resized = resize_square(img, self.image_size + self.resize_margin);

        let (x, y, w, h) = random_resized_crop_params(
            resized.width(),
            resized.height(),
            self.config.crop_scale,
            self.config.crop_ratio,
            rng,
        );
        let mut result = resized
            .crop_imm(x, y, w, h)
            .resize_exact(self.image_size, self.image_size, FilterType::Triangle)
            .to_rgb8();

        if rng.gen::<f32>() < self.config.horizontal_flip_prob {
            result = image::imageops::flip_horizontal(&result);
        }

        if self.config.rotation_degrees > 0.0 {
            let angle = rng.gen_range(-self.config.rotation_degrees..=self.config.rotation_degrees);
            result = rotate(&result, angle);
        }

        let brightness = jitter_factor(self.config.brightness_delta, rng);
        let contrast = jitter_factor(self.config.contrast_delta, rng);
        let saturation = jitter_factor(self.config.saturation_delta, rng);
        result = adjust_brightness(&result, brightness);
        result = adjust_contrast(&result, contrast);
        result = adjust_saturation(&result, saturation);

        if self.config.hue_delta > 0.0 {
            let turns = rng.gen_range(-self.config.hue_delta..=self.config.hue_delta);
            let degrees = (turns * 360.0).round() as i32;
            if degrees != 0 {
                result = image::imageops::huerotate(&result, degrees);
            }
        }

        result
    }

    pub fn apply(&self, img: &DynamicImage, rng: &mut ChaCha8Rng) -> Vec<f32> {
        to_normalized_chw(&self.augment(img, rng))
    }
}

/// Transform selected for a data split
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Eval(EvalTransform),
    Train(TrainTransform),
}

impl Transform {
    pub fn image_size(&self) -> usize {
        match self {
            Transform::Eval(t) => t.image_size(),
            Transform::Train(t) => t.image_size(),
        }
    }

    /// Apply the transform; the RNG is only consumed by the training variant
    pub fn apply(&self, img: &DynamicImage, rng: &mut ChaCha8Rng) -> Vec<f32> {
        match self {
            Transform::Eval(t) => t.apply(img),
            Transform::Train(t) => t.apply(img, rng),
        }
    }
}

impl From<EvalTransform> for Transform {
    fn from(t: EvalTransform) -> Self {
        Transform::Eval(t)
    }
}

impl From<TrainTransform> for Transform {
    fn from(t: TrainTransform) -> Self {
        Transform::Train(t)
    }
}

fn resize_square(img: &DynamicImage, side: u32) -> DynamicImage {
    img.resize_exact(side, side, FilterType::Triangle)
}

fn jitter_factor(delta: f32, rng: &mut ChaCha8Rng) -> f32 {
    if delta > 0.0 {
        rng.gen_range((1.0 - delta).max(0.0)..=1.0 + delta)
    } else {
        1.0
    }
}

/// Sample a crop `(x, y, width, height)` covering a random area and aspect ratio.
///
/// Falls back to the largest centered crop within the ratio bounds after
/// [`CROP_ATTEMPTS`] misses.
pub fn random_resized_crop_params(
    width: u32,
    height: u32,
    scale: (f32, f32),
    ratio: (f32, f32),
    rng: &mut ChaCha8Rng,
) -> (u32, u32, u32, u32) {
    let area = (width * height) as f32;
    let (log_min, log_max) = (ratio.0.ln(), ratio.1.ln());

    for _ in 0..CROP_ATTEMPTS {
        let target_area = area * rng.gen_range(scale.0..=scale.1);
        let aspect = rng.gen_range(log_min..=log_max).exp();

        let w = (target_area * aspect).sqrt().round() as u32;
        let h = (target_area / aspect).sqrt().round() as u32;

        if w > 0 && h > 0 && w <= width && h <= height {
            let x = rng.gen_range(0..=width - w);
            let y = rng.gen_range(0..=height - h);
            return (x, y, w, h);
        }
    }

    let in_ratio = width as f32 / height as f32;
    let (w, h) = if in_ratio < ratio.0 {
        (width, ((width as f32 / ratio.0).round() as u32).clamp(1, height))
    } else if in_ratio > ratio.1 {
        (((height as f32 * ratio.1).round() as u32).clamp(1, width), height)
    } else {
        (width, height)
    };

    ((width - w) / 2, (height - h) / 2, w, h)
}

/// Rotate around the center by `angle_degrees`, filling uncovered pixels with black
fn rotate(img: &RgbImage, angle_degrees: f32) -> RgbImage {
    if angle_degrees.abs() < 0.1 {
        return img.clone();
    }

    let angle_rad = angle_degrees.to_radians();
    let (width, height) = img.dimensions();

    let cx = width as f32 / 2.0;
    let cy = height as f32 / 2.0;
    let cos_a = angle_rad.cos();
    let sin_a = angle_rad.sin();

    ImageBuffer::from_fn(width, height, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;

        let src_x = cx + dx * cos_a + dy * sin_a;
        let src_y = cy - dx * sin_a + dy * cos_a;

        bilinear_sample(img, src_x, src_y)
    })
}

fn bilinear_sample(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();

    if x < 0.0 || y < 0.0 || x >= width as f32 - 1.0 || y >= height as f32 - 1.0 {
        return Rgb([0, 0, 0]);
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut result = [0u8; 3];
    for c in 0..3 {
        let v = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + p10[c] as f32 * fx * (1.0 - fy)
            + p01[c] as f32 * (1.0 - fx) * fy
            + p11[c] as f32 * fx * fy;

        result[c] = v.round().clamp(0.0, 255.0) as u8;
    }

    Rgb(result)
}

fn map_channels(img: &RgbImage, f: impl Fn(f32) -> f32) -> RgbImage {
    let mut output = img.clone();
    for pixel in output.pixels_mut() {
        for c in 0..3 {
            pixel[c] = f(pixel[c] as f32).round().clamp(0.0, 255.0) as u8;
        }
    }
    output
}

fn luma(pixel: &Rgb<u8>) -> f32 {
    0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32
}

fn adjust_brightness(img: &RgbImage, factor: f32) -> RgbImage {
    map_channels(img, |v| v * factor)
}

/// Scale pixel values around the mean luminance
fn adjust_contrast(img: &RgbImage, factor: f32) -> RgbImage {
    let count = (img.width() * img.height()).max(1) as f64;
    let mean = (img.pixels().map(|p| luma(p) as f64).sum::<f64>() / count) as f32;
    map_channels(img, |v| mean + factor * (v - mean))
}

/// Interpolate each pixel between its grayscale value and itself
fn adjust_saturation(img: &RgbImage, factor: f32) -> RgbImage {
    let mut output = img.clone();
    for pixel in output.pixels_mut() {
        let gray = luma(pixel);
        for c in 0..3 {
            pixel[c] = (gray + factor * (pixel[c] as f32 - gray)).round().clamp(0.0, 255.0) as u8;
        }
    }
    output
}
