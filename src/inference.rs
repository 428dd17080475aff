//! Model backend contracts and provider fallback
//!
//! Two black-box models are consumed:
//! - a segmentation model returning a coarse foreground-probability mask
//! - a promptable model that encodes an image once and decodes candidate
//!   masks plus confidence scores from point prompts

use crate::{
    config::ExecutionProvider,
    error::{ClearcutError, Result},
    types::SegmentationMask,
};
use image::DynamicImage;
use ndarray::{Array4, ArrayD};
use tracing::{info, warn};

/// Batch segmentation model
pub trait SegmentationBackend: Send {
    /// Produce a coarse foreground-probability mask (any resolution)
    ///
    /// # Errors
    /// - Model inference failures
    /// - Malformed model output
    fn segment(&mut self, image: &DynamicImage) -> Result<SegmentationMask>;
}

/// Opaque image encoding produced by a promptable model
#[derive(Debug, Clone, Default)]
pub struct ImageEmbedding {
    tensors: Vec<(String, ArrayD<f32>)>,
}

impl ImageEmbedding {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a named tensor
    #[must_use]
    pub fn with_tensor<S: Into<String>>(mut self, name: S, tensor: ArrayD<f32>) -> Self {
        self.tensors.push((name.into(), tensor));
        self
    }

    /// Look a tensor up by name
    #[must_use]
    pub fn tensor(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors
            .iter()
            .find(|(tensor_name, _)| tensor_name == name)
            .map(|(_, tensor)| tensor)
    }

    /// All tensors in insertion order
    pub fn tensors(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.tensors.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// Result of the promptable model's encoder
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    pub embedding: ImageEmbedding,
    /// Image size after aspect-preserving resize, before padding
    pub reshaped_size: (u32, u32),
    /// Full model input size, padding included
    pub input_size: (u32, u32),
}

/// Result of the promptable model's decoder
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// Candidate mask logits, shape `[1, candidates, height, width]`,
    /// covering the padded model input
    pub logits: Array4<f32>,
    /// One confidence score per candidate
    pub scores: Vec<f32>,
}

impl DecoderOutput {
    /// Check that logits and scores agree on the candidate count
    ///
    /// # Errors
    /// Returns `ClearcutError::Inference` for malformed decoder output
    pub fn validate(&self) -> Result<()> {
        let (batch, candidates, height, width) = self.logits.dim();
        if batch != 1 {
            return Err(ClearcutError::inference(format!(
                "Expected a single decoder batch, got {}",
                batch
            )));
        }
        if candidates == 0 || height == 0 || width == 0 {
            return Err(ClearcutError::inference(format!(
                "Decoder returned empty logits {:?}",
                self.logits.dim()
            )));
        }
        if candidates != self.scores.len() {
            return Err(ClearcutError::inference(format!(
                "Decoder returned {} masks but {} scores",
                candidates,
                self.scores.len()
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn candidate_count(&self) -> usize {
        self.scores.len()
    }
}

/// Point-promptable segmentation model
pub trait PromptableBackend: Send {
    /// Encode an image once for many decodes
    ///
    /// # Errors
    /// - Model inference failures
    fn encode(&mut self, image: &DynamicImage) -> Result<EncoderOutput>;

    /// Decode candidate masks for points given in model input coordinates
    ///
    /// `labels` holds 1.0 for keep and 0.0 for remove, one per point.
    ///
    /// # Errors
    /// - Model inference failures
    /// - Malformed model output
    fn decode(
        &mut self,
        embedding: &ImageEmbedding,
        points: &[[f32; 2]],
        labels: &[f32],
    ) -> Result<DecoderOutput>;
}

/// Factory creating a backend bound to one execution provider
pub trait BackendFactory<B: ?Sized>: Send + Sync {
    /// Create and initialize a backend on the given provider
    ///
    /// # Errors
    /// - Provider unavailable on this machine
    /// - Model loading failures
    fn create_backend(&self, provider: ExecutionProvider) -> Result<Box<B>>;
}

impl<B, F> BackendFactory<B> for F
where
    B: ?Sized,
    F: Fn(ExecutionProvider) -> Result<Box<B>> + Send + Sync,
{
    fn create_backend(&self, provider: ExecutionProvider) -> Result<Box<B>> {
        self(provider)
    }
}

/// A backend together with the provider it ended up on
pub struct LoadedBackend<B: ?Sized> {
    pub backend: Box<B>,
    pub provider: ExecutionProvider,
}

/// Create a backend, trying each provider of `requested` in order
///
/// With `ExecutionProvider::Auto` the GPU is attempted first and CPU is used
/// if that fails. Only when every attempt fails is a `Model` error returned.
///
/// # Errors
/// Returns `ClearcutError::Model` listing every failed attempt
pub fn load_with_fallback<B: ?Sized>(
    factory: &dyn BackendFactory<B>,
    requested: ExecutionProvider,
) -> Result<LoadedBackend<B>> {
    let mut failures = Vec::new();

    for &provider in requested.attempt_order() {
        match factory.create_backend(provider) {
            Ok(backend) => {
                if !failures.is_empty() {
                    warn!(
                        provider = %provider,
                        "Model loaded after falling back from a failed provider"
                    );
                }
                info!(provider = %provider, "Model backend ready");
                return Ok(LoadedBackend { backend, provider });
            },
            Err(e) => {
                warn!(provider = %provider, error = %e, "Model backend failed to initialize");
                failures.push(format!("{}: {}", provider, e));
            },
        }
    }

    Err(ClearcutError::model(format!(
        "Model initialization failed ({})",
        failures.join("; ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Fixed;

    impl SegmentationBackend for Fixed {
        fn segment(&mut self, image: &DynamicImage) -> Result<SegmentationMask> {
            Ok(SegmentationMask::new(
                vec![255; (image.width() * image.height()) as usize],
                (image.width(), image.height()),
            ))
        }
    }

    #[test]
    fn test_fallback_to_cpu_when_gpu_fails() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let factory = move |provider: ExecutionProvider| -> Result<Box<dyn SegmentationBackend>> {
            counter.fetch_add(1, Ordering::SeqCst);
            match provider {
                ExecutionProvider::Gpu => Err(ClearcutError::model("no adapter")),
                _ => Ok(Box::new(Fixed)),
            }
        };

        let loaded = load_with_fallback::<dyn SegmentationBackend>(&factory, ExecutionProvider::Auto).unwrap();
        assert_eq!(loaded.provider, ExecutionProvider::Cpu);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_gpu_only_does_not_fall_back() {
        let factory = |provider: ExecutionProvider| -> Result<Box<dyn SegmentationBackend>> {
            match provider {
                ExecutionProvider::Gpu => Err(ClearcutError::model("no adapter")),
                _ => Ok(Box::new(Fixed)),
            }
        };
        let err = load_with_fallback::<dyn SegmentationBackend>(&factory, ExecutionProvider::Gpu)
            .err()
            .unwrap();
        assert!(matches!(err, ClearcutError::Model(_)));
        assert!(err.to_string().contains("no adapter"));
    }

    #[test]
    fn test_all_providers_failing_reports_each() {
        let factory = |provider: ExecutionProvider| -> Result<Box<dyn SegmentationBackend>> {
            Err(ClearcutError::model(format!("{} broken", provider)))
        };
        let message = load_with_fallback::<dyn SegmentationBackend>(&factory, ExecutionProvider::Auto)
            .err()
            .unwrap()
            .to_string();
        assert!(message.contains("gpu broken"));
        assert!(message.contains("cpu broken"));
    }

    #[test]
    fn test_decoder_output_validation() {
        let ok = DecoderOutput {
            logits: Array4::zeros((1, 3, 8, 8)),
            scores: vec![0.1, 0.2, 0.3],
        };
        assert!(ok.validate().is_ok());

        let mismatched = DecoderOutput {
            logits: Array4::zeros((1, 3, 8, 8)),
            scores: vec![0.1],
        };
        assert!(mismatched.validate().is_err());

        let empty = DecoderOutput {
            logits: Array4::zeros((1, 0, 8, 8)),
            scores: vec![],
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_embedding_lookup() {
        let embedding = ImageEmbedding::new()
            .with_tensor("image_embeddings", ArrayD::zeros(vec![1, 4, 2, 2]));
        assert!(embedding.tensor("image_embeddings").is_some());
        assert!(embedding.tensor("missing").is_none());
        assert_eq!(embedding.tensors().count(), 1);
    }
}
