//! Messages exchanged between the host and the worker contexts
//!
//! Each command and status kind is one variant carrying only the fields it
//! needs. Images and masks cross the boundary as encoded bytes, so the host
//! never handles pixel buffers.

use crate::{
    config::{ExecutionProvider, SegmentationConfig},
    error::ClearcutError,
    prompt::DecodeOptions,
    types::{ItemId, Point, SessionId},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Commands accepted by the batch matting worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum MattingCommand {
    /// Load the segmentation model ahead of the first item
    Preload,
    /// Remove the background of one encoded image
    Process { id: ItemId, image: Vec<u8> },
}

/// One decode call of the interactive session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeRequest {
    pub session: SessionId,
    pub points: Vec<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smoothness: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_index: Option<usize>,
}

impl DecodeRequest {
    #[must_use]
    pub fn new(session: SessionId, points: Vec<Point>) -> Self {
        Self {
            session,
            points,
            sensitivity: None,
            smoothness: None,
            mask_index: None,
        }
    }

    #[must_use]
    pub fn with_sensitivity(mut self, sensitivity: f32) -> Self {
        self.sensitivity = Some(sensitivity);
        self
    }

    #[must_use]
    pub fn with_smoothness(mut self, smoothness: f32) -> Self {
        self.smoothness = Some(smoothness);
        self
    }

    #[must_use]
    pub fn with_mask_index(mut self, index: usize) -> Self {
        self.mask_index = Some(index);
        self
    }

    /// Resolve missing controls against the session defaults
    #[must_use]
    pub fn options(&self, config: &SegmentationConfig) -> DecodeOptions {
        DecodeOptions {
            sensitivity: self.sensitivity.unwrap_or(config.default_sensitivity),
            smoothness: self.smoothness.unwrap_or(config.default_smoothness),
            mask_index: self.mask_index,
        }
    }
}

/// Commands accepted by the interactive segmentation worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum SegmentationCommand {
    /// Load the promptable model
    Preload,
    /// Encode an image once for the given session
    Encode { session: SessionId, image: Vec<u8> },
    /// Decode masks from the current prompt; debounced by the worker
    Decode(DecodeRequest),
}

/// Status messages emitted by either worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Model loading has started
    Loading,
    /// Model is loaded on the reported provider
    Ready { provider: ExecutionProvider },
    /// Embedding for `session` is cached
    Encoded { session: SessionId },
    /// Lossless display and raw masks from one decode call
    Decoded {
        session: SessionId,
        display_mask: Vec<u8>,
        raw_mask: Vec<u8>,
    },
    /// Batch item picked up
    Processing { id: ItemId },
    /// Batch item finished with a lossless RGBA image
    Complete { id: ItemId, result: Vec<u8> },
    /// A failure; `id` names the item or session, `None` means the worker itself
    Error { id: Option<Uuid>, message: String },
}

impl WorkerStatus {
    /// Structured error for the given item, session or worker
    #[must_use]
    pub fn error(id: Option<Uuid>, error: &ClearcutError) -> Self {
        Self::Error {
            id,
            message: error.to_string(),
        }
    }

    /// Whether this status reports a failure of the worker as a whole
    #[must_use]
    pub fn is_system_error(&self) -> bool {
        matches!(self, Self::Error { id: None, .. })
    }
}
