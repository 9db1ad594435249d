//! Backbone + head image classifier
//!
//! Architecture:
//! - Backbone: 4 convolutional blocks (`base`, `2·base`, `4·base`, `8·base`
//!   filters), each conv → BatchNorm → ReLU → 2×2 max-pool, then global
//!   average pooling. Output is the pooled feature vector of length `8·base`.
//! - Head: dropout → linear(features → 512) → BatchNorm → ReLU → dropout →
//!   linear(512 → num_classes)

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    record::CompactRecorder,
    tensor::{backend::Backend, Tensor},
};
use tracing::info;

use crate::utils::error::{Error, Result as CrateResult};

/// Configuration for the [`Classifier`]
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    /// Number of output classes
    pub num_classes: usize,

    /// Dropout rate used twice in the head
    #[config(default = "crate::model::DEFAULT_DROPOUT")]
    pub dropout: f64,

    /// Filters in the first convolutional block
    #[config(default = "32")]
    pub base_filters: usize,

    /// Width of the hidden layer in the head
    #[config(default = "crate::model::DEFAULT_HIDDEN_SIZE")]
    pub hidden_size: usize,

    /// Number of input channels (3 for RGB)
    #[config(default = "3")]
    pub in_channels: usize,
}

impl ClassifierConfig {
    /// Length of the pooled backbone output
    pub fn feature_size(&self) -> usize {
        self.base_filters * 8
    }

    /// Randomly initialized model
    pub fn init<B: Backend>(&self, device: &B::Device) -> Classifier<B> {
        Classifier::new(self, device)
    }

    /// Model whose backbone starts from weights written by [`Backbone::export`]
    pub fn init_with_backbone<B: Backend>(
        &self,
        backbone_path: &Path,
        device: &B::Device,
    ) -> CrateResult<Classifier<B>> {
        let backbone = Backbone::new(self.in_channels, self.base_filters, device)
            .load_file(backbone_path.to_path_buf(), &CompactRecorder::new(), device)
            .map_err(|e| {
                Error::Model(format!(
                    "Failed to load backbone weights from {:?}: {:?}",
                    backbone_path, e
                ))
            })?;
        info!("Initialized backbone from {:?}", backbone_path);

        Ok(Classifier {
            backbone,
            head: ClassifierHead::new(self, device),
            num_classes: self.num_classes,
        })
    }
}

/// Conv2d → BatchNorm → ReLU → MaxPool
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    pub relu: Relu,
    pub pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);
        self.pool.forward(x)
    }
}

/// Feature extractor without a classification layer
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    pub conv1: ConvBlock<B>,
    pub conv2: ConvBlock<B>,
    pub conv3: ConvBlock<B>,
    pub conv4: ConvBlock<B>,
    pub global_pool: AdaptiveAvgPool2d,
    feature_size: usize,
}

impl<B: Backend> Backbone<B> {
    pub fn new(in_channels: usize, base_filters: usize, device: &B::Device) -> Self {
        let base = base_filters;

        Self {
            conv1: ConvBlock::new(in_channels, base, device),
            conv2: ConvBlock::new(base, base * 2, device),
            conv3: ConvBlock::new(base * 2, base * 4, device),
            conv4: ConvBlock::new(base * 4, base * 8, device),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            feature_size: base * 8,
        }
    }

    /// `[B, C, H, W]` → pooled features `[B, 8·base]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.conv1.forward(x);
        let x = self.conv2.forward(x);
        let x = self.conv3.forward(x);
        let x = self.conv4.forward(x);

        // [B, C, H, W] -> [B, C, 1, 1] -> [B, C]
        let x = self.global_pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        x.reshape([batch_size, channels])
    }

    pub fn feature_size(&self) -> usize {
        self.feature_size
    }

    /// Write the backbone weights so another classifier can start from them.
    ///
    /// The recorder appends its own extension to `path`.
    pub fn export(&self, path: &Path) -> CrateResult<()> {
        self.clone()
            .save_file(path.to_path_buf(), &CompactRecorder::new())
            .map_err(|e| Error::Model(format!("Failed to save backbone to {:?}: {:?}", path, e)))
    }
}

/// Classification head on top of pooled features
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    pub dropout1: Dropout,
    pub fc1: Linear<B>,
    pub bn: BatchNorm<B, 1>,
    pub relu: Relu,
    pub dropout2: Dropout,
    pub fc2: Linear<B>,
}

impl<B: Backend> ClassifierHead<B> {
    pub fn new(config: &ClassifierConfig, device: &B::Device) -> Self {
        Self {
            dropout1: DropoutConfig::new(config.dropout).init(),
            fc1: LinearConfig::new(config.feature_size(), config.hidden_size).init(device),
            bn: BatchNormConfig::new(config.hidden_size).init(device),
            relu: Relu::new(),
            dropout2: DropoutConfig::new(config.dropout).init(),
            fc2: LinearConfig::new(config.hidden_size, config.num_classes).init(device),
        }
    }

    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.dropout1.forward(features);
        let x = self.fc1.forward(x);

        // BatchNorm expects a channel axis followed by spatial axes
        let [batch_size, hidden] = x.dims();
        let x = self
            .bn
            .forward(x.reshape([batch_size, hidden, 1]))
            .reshape([batch_size, hidden]);

        let x = self.relu.forward(x);
        let x = self.dropout2.forward(x);
        self.fc2.forward(x)
    }

    /// Number of logits produced, read from the output layer weights
    pub fn output_width(&self) -> usize {
        self.fc2.weight.val().dims()[1]
    }
}

/// Backbone + head classifier
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    pub backbone: Backbone<B>,
    pub head: ClassifierHead<B>,
    num_classes: usize,
}

impl<B: Backend> Classifier<B> {
    pub fn new(config: &ClassifierConfig, device: &B::Device) -> Self {
        Self {
            backbone: Backbone::new(config.in_channels, config.base_filters, device),
            head: ClassifierHead::new(config, device),
            num_classes: config.num_classes,
        }
    }

    /// Logits `[batch_size, num_classes]` for input `[batch_size, 3, H, W]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(x))
    }

    /// Class probabilities
    pub fn forward_softmax(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        burn::tensor::activation::softmax(self.forward(x), 1)
    }

    /// Pooled backbone features, before the head
    pub fn extract_features(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        self.backbone.forward(x)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn feature_size(&self) -> usize {
        self.backbone.feature_size()
    }

    /// Fail unless the head produces exactly `expected` logits
    pub fn ensure_num_classes(&self, expected: usize) -> CrateResult<()> {
        let width = self.head.output_width();
        if width != expected || self.num_classes != expected {
            return Err(Error::ClassMismatch {
                expected,
                found: width,
                context: "classifier head output width".to_string(),
            });
        }
        Ok(())
    }
}
