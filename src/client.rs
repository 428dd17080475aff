//! Host side of an interactive selection
//!
//! `SegmentationClient` owns the segmentation worker for one open image. It
//! turns clicks into prompts, keeps the latest display/raw mask pair as
//! previews and discards anything the worker sends for another session.

use crate::{
    config::{ExecutionProvider, OutputFormat, SegmentationConfig},
    error::{ClearcutError, Result},
    geometry::Letterbox,
    matting::extract_with_raw_mask,
    preview::{PreviewRegistry, PreviewUrl},
    protocol::{DecodeRequest, SegmentationCommand, WorkerStatus},
    types::{encode_rgba, Point, PointLabel, SessionId},
    worker::SegmentationWorker,
};
use image::ImageReader;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Display and raw previews from the same decode call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskPreviews {
    pub display: PreviewUrl,
    pub raw: PreviewUrl,
}

/// Interactive selection on one image
#[derive(Debug)]
pub struct SegmentationClient {
    worker: SegmentationWorker,
    previews: PreviewRegistry,
    session: SessionId,
    source: Arc<[u8]>,
    natural_size: (u32, u32),
    points: Vec<Point>,
    mode: PointLabel,
    sensitivity: f32,
    smoothness: f32,
    mask_index: Option<usize>,
    masks: Option<MaskPreviews>,
    error: Option<String>,
    encoded: bool,
    provider: Option<ExecutionProvider>,
}

impl SegmentationClient {
    /// Open `image` in a new session and ask the worker to encode it
    ///
    /// # Errors
    /// - Image header errors
    /// - `ClearcutError::Worker` when the worker has stopped
    pub async fn open(
        worker: SegmentationWorker,
        previews: PreviewRegistry,
        image: impl Into<Arc<[u8]>>,
        config: &SegmentationConfig,
    ) -> Result<Self> {
        let source: Arc<[u8]> = image.into();
        let natural_size = ImageReader::new(Cursor::new(&source[..]))
            .with_guessed_format()?
            .into_dimensions()?;

        let session = Uuid::new_v4();
        worker
            .send(SegmentationCommand::Encode {
                session,
                image: source.to_vec(),
            })
            .await?;
        info!(%session, width = natural_size.0, height = natural_size.1, "Selection opened");

        Ok(Self {
            worker,
            previews,
            session,
            source,
            natural_size,
            points: Vec::new(),
            mode: PointLabel::Keep,
            sensitivity: config.default_sensitivity,
            smoothness: config.default_smoothness,
            mask_index: None,
            masks: None,
            error: None,
            encoded: false,
            provider: None,
        })
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn natural_size(&self) -> (u32, u32) {
        self.natural_size
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn mode(&self) -> PointLabel {
        self.mode
    }

    /// Label given to subsequent clicks
    pub fn set_mode(&mut self, mode: PointLabel) {
        self.mode = mode;
    }

    pub fn masks(&self) -> Option<MaskPreviews> {
        self.masks
    }

    pub fn is_encoded(&self) -> bool {
        self.encoded
    }

    pub fn provider(&self) -> Option<ExecutionProvider> {
        self.provider
    }

    /// Current error banner
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn dismiss_error(&mut self) {
        self.error = None;
    }

    /// Add a point from a click inside a display region of `region` size
    ///
    /// Returns `false` when the click lands in the letterbox margins.
    ///
    /// # Errors
    /// Returns `ClearcutError::Worker` when the worker has stopped
    pub async fn click(&mut self, position: (f32, f32), region: (f32, f32)) -> Result<bool> {
        let natural = (self.natural_size.0 as f32, self.natural_size.1 as f32);
        let Some((x, y)) = Letterbox::contain(natural, region)
            .and_then(|letterbox| letterbox.display_to_natural(position.0, position.1))
        else {
            debug!(?position, "Click outside the image ignored");
            return Ok(false);
        };

        self.add_point(Point { x, y, label: self.mode }).await?;
        Ok(true)
    }

    /// Add a point in natural image coordinates
    ///
    /// # Errors
    /// Returns `ClearcutError::Worker` when the worker has stopped
    pub async fn add_point(&mut self, point: Point) -> Result<()> {
        self.points.push(point);
        self.request_decode().await
    }

    /// Drop every point and the current masks
    ///
    /// # Errors
    /// Returns preview release errors
    pub fn clear_points(&mut self) -> Result<()> {
        self.points.clear();
        self.release_masks()
    }

    /// # Errors
    /// Returns `ClearcutError::Worker` when the worker has stopped
    pub async fn set_sensitivity(&mut self, sensitivity: f32) -> Result<()> {
        self.sensitivity = sensitivity;
        self.request_decode().await
    }

    /// # Errors
    /// Returns `ClearcutError::Worker` when the worker has stopped
    pub async fn set_smoothness(&mut self, smoothness: f32) -> Result<()> {
        self.smoothness = smoothness;
        self.request_decode().await
    }

    /// Pin a candidate mask, or `None` for the highest-scoring one
    ///
    /// # Errors
    /// Returns `ClearcutError::Worker` when the worker has stopped
    pub async fn set_mask_index(&mut self, index: Option<usize>) -> Result<()> {
        self.mask_index = index;
        self.request_decode().await
    }

    async fn request_decode(&mut self) -> Result<()> {
        if self.points.is_empty() {
            return Ok(());
        }
        let mut request = DecodeRequest::new(self.session, self.points.clone())
            .with_sensitivity(self.sensitivity)
            .with_smoothness(self.smoothness);
        request.mask_index = self.mask_index;
        self.worker.send(SegmentationCommand::Decode(request)).await
    }

    /// Apply one worker status
    ///
    /// # Errors
    /// Returns preview release errors
    pub fn handle_status(&mut self, status: &WorkerStatus) -> Result<()> {
        match status {
            WorkerStatus::Ready { provider } => self.provider = Some(*provider),
            WorkerStatus::Encoded { session } if *session == self.session => self.encoded = true,
            WorkerStatus::Decoded {
                session,
                display_mask,
                raw_mask,
            } if *session == self.session => {
                self.release_masks()?;
                self.masks = Some(MaskPreviews {
                    display: self.previews.create(display_mask.clone()),
                    raw: self.previews.create(raw_mask.clone()),
                });
            },
            WorkerStatus::Error { id, message } if id.map_or(true, |id| id == self.session) => {
                warn!(session = %self.session, error = %message, "Selection error");
                self.error = Some(message.clone());
            },
            other => debug!(?other, "Status for another session discarded"),
        }
        Ok(())
    }

    /// Wait for the next worker status and apply it
    ///
    /// Returns `None` once the worker has stopped.
    ///
    /// # Errors
    /// Returns preview release errors
    pub async fn next_status(&mut self) -> Result<Option<WorkerStatus>> {
        let Some(status) = self.worker.recv().await else {
            return Ok(None);
        };
        self.handle_status(&status)?;
        Ok(Some(status))
    }

    /// Wait until masks for this session arrive
    ///
    /// # Errors
    /// - `ClearcutError::Decode` with the worker's message when it reports an error
    /// - `ClearcutError::Worker` when the worker stops first
    pub async fn wait_for_masks(&mut self) -> Result<MaskPreviews> {
        loop {
            let status = self
                .next_status()
                .await?
                .ok_or_else(|| ClearcutError::worker("Segmentation worker stopped"))?;
            match status {
                WorkerStatus::Decoded { session, .. } if session == self.session => {
                    return self
                        .masks
                        .ok_or_else(|| ClearcutError::internal("Decoded masks were not stored"));
                },
                WorkerStatus::Error { id, message } if id.map_or(true, |id| id == self.session) => {
                    return Err(ClearcutError::decode(message));
                },
                _ => {},
            }
        }
    }

    /// Marker positions for the current points in a display region
    pub fn display_coords(&self, region: (f32, f32)) -> Vec<((f32, f32), PointLabel)> {
        let natural = (self.natural_size.0 as f32, self.natural_size.1 as f32);
        let Some(letterbox) = Letterbox::contain(natural, region) else {
            return Vec::new();
        };
        self.points
            .iter()
            .map(|point| (letterbox.natural_to_display(point.x, point.y), point.label))
            .collect()
    }

    /// Cut the current raw mask out of the source image
    ///
    /// # Errors
    /// - `ClearcutError::Decode` when no masks have been decoded yet
    /// - Image decoding or encoding errors
    pub fn extract(&self, format: OutputFormat) -> Result<Vec<u8>> {
        let masks = self
            .masks
            .ok_or_else(|| ClearcutError::decode("No selection to extract"))?;
        let raw = self
            .previews
            .get(masks.raw)
            .ok_or_else(|| ClearcutError::internal("Raw mask preview is no longer live"))?;

        let original = image::load_from_memory(&self.source)?.to_rgba8();
        let raw = image::load_from_memory(&raw)?.to_rgba8();
        let cut = extract_with_raw_mask(&original, &raw)?;
        encode_rgba(&cut, format)
    }

    fn release_masks(&mut self) -> Result<()> {
        if let Some(masks) = self.masks.take() {
            self.previews.release(masks.display)?;
            self.previews.release(masks.raw)?;
        }
        Ok(())
    }

    /// Terminate the worker and release the mask previews
    ///
    /// # Errors
    /// Returns preview release errors
    pub fn close(mut self) -> Result<()> {
        self.worker.terminate();
        info!(session = %self.session, "Selection closed");
        self.release_masks()
    }
}

impl Drop for SegmentationClient {
    fn drop(&mut self) {
        if let Err(e) = self.release_masks() {
            warn!(error = %e, "Failed to release mask previews");
        }
    }
}
