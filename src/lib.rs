#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

//! # Clearcut
//!
//! On-device background removal with two pipelines:
//!
//! - **Batch matting**: a segmentation model produces a coarse foreground mask,
//!   which a guided filter refines against the image's luminance so the alpha
//!   edge follows real image edges. Soft alpha is preserved; only near-zero
//!   haze is cut to fully transparent.
//! - **Interactive selection**: a promptable model encodes the image once and
//!   then decodes masks from keep/remove points as often as the user changes
//!   them. Every decode yields a tinted overlay and a raw cut mask derived from
//!   the same probability map.
//!
//! Model inference runs inside worker tasks that talk to the host through
//! tagged command/status messages. The batch queue feeds the matting worker
//! one image at a time.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use clearcut::{
//!     backends::OnnxSegmenterFactory, run_batch, spawn_matting_worker, CoordinatorConfig,
//!     MattingConfig, PreviewRegistry, ProcessStatus, ProcessingCoordinator,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let factory = Arc::new(OnnxSegmenterFactory::new("models/segmentation.onnx"));
//! let mut worker = spawn_matting_worker(factory, MattingConfig::default(), &CoordinatorConfig::default())?;
//!
//! let mut queue = ProcessingCoordinator::new(PreviewRegistry::new());
//! queue.add_image("photo.jpg", std::fs::read("photo.jpg")?, ProcessStatus::Queued)?;
//!
//! let summary = run_batch(&mut queue, &mut worker).await?;
//! println!("{} done, {} failed", summary.done, summary.failed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `onnx` (default): ONNX Runtime backends with CUDA / `CoreML` acceleration
//! - `cli` (default): command-line interface and tracing subscriber setup
//! - `webp-support` (default): lossless WebP output
//! - `tracing-json`: JSON log output for the CLI

pub mod backends;
#[cfg(feature = "cli")]
pub mod cli;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod filter;
pub mod geometry;
pub mod inference;
pub mod matting;
pub mod preview;
pub mod prompt;
pub mod protocol;
pub mod session;
#[cfg(feature = "cli")]
pub mod tracing_config;
pub mod types;
pub mod utils;
pub mod worker;

use tokio::io::AsyncRead;

pub use client::{MaskPreviews, SegmentationClient};
pub use config::{
    CoordinatorConfig, ExecutionProvider, MaskThresholds, MattingConfig, MattingConfigBuilder,
    OutputFormat, SegmentationConfig, SegmentationConfigBuilder,
};
pub use coordinator::{
    run_batch, run_batch_with, BatchSummary, ImageItem, ProcessStatus, ProcessingCoordinator,
    QueueCounts,
};
pub use error::{ClearcutError, Result};
pub use filter::{adaptive_radius, box_blur, guided_filter};
pub use geometry::{map_display_to_natural, map_natural_to_display, Letterbox};
pub use inference::{
    load_with_fallback, BackendFactory, DecoderOutput, EncoderOutput, ImageEmbedding,
    PromptableBackend, SegmentationBackend,
};
pub use matting::{extract_with_raw_mask, MattingCompositor};
pub use preview::{PreviewRegistry, PreviewStats, PreviewUrl};
pub use prompt::{DecodeOptions, PromptGeometry};
pub use protocol::{DecodeRequest, MattingCommand, SegmentationCommand, WorkerStatus};
pub use session::{EncodedContext, InteractiveSession, SessionState};
pub use types::{
    ItemId, MaskResult, MattingResult, Point, PointLabel, ProcessingTimings, SegmentationMask,
    SessionId,
};
pub use utils::{ImagePreprocessor, PreprocessingConfig, ResizeMode};
pub use worker::{
    spawn_matting_worker, spawn_segmentation_worker, MattingWorker, SegmentationWorker,
    WorkerHandle,
};

#[cfg(feature = "cli")]
pub use tracing_config::{init_cli_tracing, TracingConfig, TracingFormat};

/// Remove the background of an image given as encoded bytes
///
/// Runs on the calling task; use the matting worker to keep inference off
/// the host.
///
/// # Examples
///
/// ```rust,no_run
/// use clearcut::{backends::MockSegmenterFactory, BackendFactory, ExecutionProvider, MattingConfig};
///
/// # async fn example(upload: Vec<u8>) -> anyhow::Result<()> {
/// let mut backend = MockSegmenterFactory::new().create_backend(ExecutionProvider::Cpu)?;
/// let result =
///     clearcut::remove_background_from_bytes(&upload, backend.as_mut(), &MattingConfig::default()).await?;
/// result.save_png("output.png")?;
/// # Ok(())
/// # }
/// ```
pub async fn remove_background_from_bytes(
    image_bytes: &[u8],
    backend: &mut dyn SegmentationBackend,
    config: &MattingConfig,
) -> Result<MattingResult> {
    let image = image::load_from_memory(image_bytes).map_err(|e| {
        ClearcutError::processing(format!("Failed to decode image from bytes: {}", e))
    })?;
    remove_background_from_image(&image, backend, config).await
}

/// Remove the background of a decoded image
pub async fn remove_background_from_image(
    image: &image::DynamicImage,
    backend: &mut dyn SegmentationBackend,
    config: &MattingConfig,
) -> Result<MattingResult> {
    MattingCompositor::new(config.clone())?.process(backend, image)
}

/// Remove the background of an image read from an async stream
pub async fn remove_background_from_reader<R: AsyncRead + Unpin>(
    mut reader: R,
    backend: &mut dyn SegmentationBackend,
    config: &MattingConfig,
) -> Result<MattingResult> {
    let mut buffer = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buffer)
        .await
        .map_err(|e| ClearcutError::processing(format!("Failed to read from stream: {}", e)))?;
    remove_background_from_bytes(&buffer, backend, config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MockSegmenterFactory;
    use image::{Rgba, RgbaImage};

    #[tokio::test]
    async fn test_remove_background_from_reader() {
        let bytes = types::encode_rgba(
            &RgbaImage::from_pixel(48, 32, Rgba([90, 140, 200, 255])),
            OutputFormat::Png,
        )
        .unwrap();
        let mut backend = MockSegmenterFactory::new()
            .create_backend(ExecutionProvider::Cpu)
            .unwrap();

        let result = remove_background_from_reader(
            std::io::Cursor::new(bytes),
            backend.as_mut(),
            &MattingConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(result.dimensions(), (48, 32));
        assert_eq!(result.radius, 2);
    }

    #[tokio::test]
    async fn test_undecodable_bytes() {
        let mut backend = MockSegmenterFactory::new()
            .create_backend(ExecutionProvider::Cpu)
            .unwrap();
        let err = remove_background_from_bytes(&[0, 1, 2], backend.as_mut(), &MattingConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClearcutError::Processing(_)));
    }
}
