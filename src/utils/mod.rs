//! Shared utilities for model input and output handling

pub mod preprocessing;

pub use preprocessing::{ImagePreprocessor, PreparedInput, PreprocessingConfig, ResizeMode};
