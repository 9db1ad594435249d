//! Model module
//!
//! A convolutional backbone that ends in global average pooling, topped with a
//! freshly initialized classification head.

pub mod classifier;

pub use classifier::{Backbone, Classifier, ClassifierConfig, ClassifierHead, ConvBlock};

/// Default dropout rate in the head
pub const DEFAULT_DROPOUT: f64 = 0.2;

/// Width of the hidden layer in the head
pub const DEFAULT_HIDDEN_SIZE: usize = 512;
