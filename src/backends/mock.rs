//! Deterministic in-process backends
//!
//! These stand in for real models in tests, benchmarks and demos. Each
//! factory shares a `MockStats` with every backend it creates so callers can
//! count model calls and inject failures.

use crate::{
    config::ExecutionProvider,
    error::{ClearcutError, Result},
    inference::{
        BackendFactory, DecoderOutput, EncoderOutput, ImageEmbedding, PromptableBackend,
        SegmentationBackend,
    },
    types::SegmentationMask,
    utils::{ImagePreprocessor, PreprocessingConfig, ResizeMode},
};
use image::DynamicImage;
use ndarray::Array4;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Call counters and failure switches shared between a factory and its backends
#[derive(Debug, Default)]
pub struct MockStats {
    created: AtomicUsize,
    segments: AtomicUsize,
    encodes: AtomicUsize,
    decodes: AtomicUsize,
    last_point_count: AtomicUsize,
    fail_next_decode: AtomicBool,
    fail_next_segment: AtomicBool,
    processed_widths: Mutex<Vec<u32>>,
}

impl MockStats {
    /// Backends successfully created
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn segments(&self) -> usize {
        self.segments.load(Ordering::SeqCst)
    }

    pub fn encodes(&self) -> usize {
        self.encodes.load(Ordering::SeqCst)
    }

    pub fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }

    /// Points passed to the most recent decode, corner anchors included
    pub fn last_point_count(&self) -> usize {
        self.last_point_count.load(Ordering::SeqCst)
    }

    /// Make the next decode call fail with an inference error
    pub fn fail_next_decode(&self) {
        self.fail_next_decode.store(true, Ordering::SeqCst);
    }

    /// Make the next segmentation call fail with an inference error
    pub fn fail_next_segment(&self) {
        self.fail_next_segment.store(true, Ordering::SeqCst);
    }

    /// Widths of the images segmented so far, in call order
    pub fn processed_widths(&self) -> Vec<u32> {
        self.processed_widths
            .lock()
            .map(|widths| widths.clone())
            .unwrap_or_default()
    }
}

/// Segmentation model returning a soft centered disc
#[derive(Debug)]
pub struct MockSegmenter {
    stats: Arc<MockStats>,
    output_size: u32,
    fail_width: Option<u32>,
}

impl MockSegmenter {
    /// Coarse output resolution
    pub const OUTPUT_SIZE: u32 = 32;

    #[must_use]
    pub fn new(stats: Arc<MockStats>) -> Self {
        Self {
            stats,
            output_size: Self::OUTPUT_SIZE,
            fail_width: None,
        }
    }
}

impl SegmentationBackend for MockSegmenter {
    fn segment(&mut self, image: &DynamicImage) -> Result<SegmentationMask> {
        self.stats.segments.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut widths) = self.stats.processed_widths.lock() {
            widths.push(image.width());
        }

        if self.stats.fail_next_segment.swap(false, Ordering::SeqCst)
            || self.fail_width == Some(image.width())
        {
            return Err(ClearcutError::inference("Mock segmentation failure"));
        }

        let size = self.output_size;
        let center = size as f32 / 2.0;
        let radius = size as f32 / 3.0;
        let values: Vec<f32> = (0..size * size)
            .map(|i| {
                let dx = (i % size) as f32 + 0.5 - center;
                let dy = (i / size) as f32 + 0.5 - center;
                let distance = (dx * dx + dy * dy).sqrt();
                ((radius - distance) / 2.0 + 0.5).clamp(0.0, 1.0)
            })
            .collect();
        Ok(SegmentationMask::from_probabilities(&values, (size, size)))
    }
}

/// Promptable model whose masks grow around keep points
///
/// Each candidate is a disc of a different radius around the nearest keep
/// point; cells closer to a remove point than to any keep point are
/// background. Candidate 1 has the highest score.
#[derive(Debug)]
pub struct MockPromptable {
    stats: Arc<MockStats>,
    preprocessing: PreprocessingConfig,
    mask_size: usize,
}

impl MockPromptable {
    pub const CANDIDATES: usize = 3;
    pub const SCORES: [f32; 3] = [0.62, 0.91, 0.78];
    const RADII: [f32; 3] = [0.15, 0.3, 0.45];

    #[must_use]
    pub fn new(stats: Arc<MockStats>) -> Self {
        Self {
            stats,
            preprocessing: PreprocessingConfig {
                target_size: [64, 64],
                resize: ResizeMode::LongestSide,
                ..PreprocessingConfig::promptable()
            },
            mask_size: 16,
        }
    }
}

impl PromptableBackend for MockPromptable {
    fn encode(&mut self, image: &DynamicImage) -> Result<EncoderOutput> {
        self.stats.encodes.fetch_add(1, Ordering::SeqCst);
        let prepared = ImagePreprocessor::preprocess(image, &self.preprocessing)?;
        Ok(EncoderOutput {
            embedding: ImageEmbedding::new().with_tensor("image_embeddings", prepared.tensor.into_dyn()),
            reshaped_size: prepared.reshaped_size,
            input_size: prepared.input_size,
        })
    }

    fn decode(
        &mut self,
        embedding: &ImageEmbedding,
        points: &[[f32; 2]],
        labels: &[f32],
    ) -> Result<DecoderOutput> {
        self.stats.decodes.fetch_add(1, Ordering::SeqCst);
        self.stats.last_point_count.store(points.len(), Ordering::SeqCst);

        if self.stats.fail_next_decode.swap(false, Ordering::SeqCst) {
            return Err(ClearcutError::inference("Mock decoder failure"));
        }
        if embedding.tensor("image_embeddings").is_none() {
            return Err(ClearcutError::inference("Missing image embeddings"));
        }
        if points.len() != labels.len() {
            return Err(ClearcutError::inference("Point and label counts differ"));
        }

        let input = self.preprocessing.target_size[0] as f32;
        let cell = input / self.mask_size as f32;
        let nearest = |x: f32, y: f32, wanted: f32| -> f32 {
            points
                .iter()
                .zip(labels)
                .filter(|(_, label)| **label == wanted)
                .map(|(p, _)| ((p[0] - x).powi(2) + (p[1] - y).powi(2)).sqrt())
                .fold(f32::INFINITY, f32::min)
        };

        let logits = Array4::from_shape_fn(
            (1, Self::CANDIDATES, self.mask_size, self.mask_size),
            |(_, candidate, row, col)| {
                let x = (col as f32 + 0.5) * cell;
                let y = (row as f32 + 0.5) * cell;
                let keep = nearest(x, y, 1.0);
                let remove = nearest(x, y, 0.0);
                if !keep.is_finite() || remove < keep {
                    return -8.0;
                }
                (Self::RADII[candidate] * input - keep) / cell
            },
        );

        Ok(DecoderOutput {
            logits,
            scores: Self::SCORES.to_vec(),
        })
    }
}

fn check_provider(failing: &[ExecutionProvider], provider: ExecutionProvider) -> Result<()> {
    if failing.contains(&provider) {
        return Err(ClearcutError::model(format!(
            "Mock backend unavailable on {}",
            provider
        )));
    }
    Ok(())
}

/// Factory for `MockSegmenter`
#[derive(Debug, Default, Clone)]
pub struct MockSegmenterFactory {
    stats: Arc<MockStats>,
    failing: Vec<ExecutionProvider>,
    fail_width: Option<u32>,
}

impl MockSegmenterFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to create backends on `provider`
    #[must_use]
    pub fn fail_on(mut self, provider: ExecutionProvider) -> Self {
        self.failing.push(provider);
        self
    }

    /// Fail segmentation of every image that is `width` pixels wide
    #[must_use]
    pub fn fail_images_of_width(mut self, width: u32) -> Self {
        self.fail_width = Some(width);
        self
    }

    #[must_use]
    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }
}

impl BackendFactory<dyn SegmentationBackend> for MockSegmenterFactory {
    fn create_backend(&self, provider: ExecutionProvider) -> Result<Box<dyn SegmentationBackend>> {
        check_provider(&self.failing, provider)?;
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        let mut backend = MockSegmenter::new(Arc::clone(&self.stats));
        backend.fail_width = self.fail_width;
        Ok(Box::new(backend))
    }
}

/// Factory for `MockPromptable`
#[derive(Debug, Default, Clone)]
pub struct MockPromptableFactory {
    stats: Arc<MockStats>,
    failing: Vec<ExecutionProvider>,
}

impl MockPromptableFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to create backends on `provider`
    #[must_use]
    pub fn fail_on(mut self, provider: ExecutionProvider) -> Self {
        self.failing.push(provider);
        self
    }

    #[must_use]
    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }
}

impl BackendFactory<dyn PromptableBackend> for MockPromptableFactory {
    fn create_backend(&self, provider: ExecutionProvider) -> Result<Box<dyn PromptableBackend>> {
        check_provider(&self.failing, provider)?;
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockPromptable::new(Arc::clone(&self.stats))))
    }
}
