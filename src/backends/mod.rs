//! Backend implementations of the model contracts
//!
//! - ONNX Runtime backends for the segmentation and promptable models
//! - Deterministic mock backends for tests, benchmarks and demos

pub mod mock;

#[cfg(feature = "onnx")]
pub mod onnx;

pub use self::mock::{MockPromptable, MockPromptableFactory, MockSegmenter, MockSegmenterFactory, MockStats};

#[cfg(feature = "onnx")]
pub use self::onnx::{
    available_gpu_providers, OnnxPromptable, OnnxPromptableFactory, OnnxSegmenter, OnnxSegmenterFactory, PromptableIo,
};
