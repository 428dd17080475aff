//! Interactive point-prompt session
//!
//! One `InteractiveSession` lives inside the segmentation worker. It owns the
//! promptable backend and at most one `EncodedContext`. The image is encoded
//! once per session id; every prompt change only runs the decoder.

use crate::{
    config::{ExecutionProvider, SegmentationConfig},
    error::{ClearcutError, Result},
    inference::{load_with_fallback, BackendFactory, ImageEmbedding, LoadedBackend, PromptableBackend},
    prompt::{masks_from_output, prepare_prompt, PromptGeometry},
    protocol::DecodeRequest,
    types::{MaskResult, SessionId},
};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// Lifecycle of the interactive session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No encoded image
    Idle,
    ModelLoading,
    Embedding,
    /// Encoded image cached, waiting for prompts
    Ready,
    Decoding,
}

/// Cached encoding of one image
#[derive(Debug, Clone)]
pub struct EncodedContext {
    pub session: SessionId,
    pub embedding: ImageEmbedding,
    pub geometry: PromptGeometry,
}

impl EncodedContext {
    #[must_use]
    pub fn original_size(&self) -> (u32, u32) {
        self.geometry.original_size
    }

    #[must_use]
    pub fn reshaped_size(&self) -> (u32, u32) {
        self.geometry.reshaped_size
    }
}

/// Encode-once, decode-many session state
pub struct InteractiveSession {
    config: SegmentationConfig,
    backend: Option<LoadedBackend<dyn PromptableBackend>>,
    context: Option<EncodedContext>,
    state: SessionState,
    encode_count: usize,
    decode_count: usize,
}

impl InteractiveSession {
    /// # Errors
    /// Returns `ClearcutError::InvalidConfig` for an invalid configuration
    pub fn new(config: SegmentationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            backend: None,
            context: None,
            state: SessionState::Idle,
            encode_count: 0,
            decode_count: 0,
        })
    }

    #[must_use]
    pub fn config(&self) -> &SegmentationConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Provider the model ended up on, once loaded
    #[must_use]
    pub fn provider(&self) -> Option<ExecutionProvider> {
        self.backend.as_ref().map(|loaded| loaded.provider)
    }

    #[must_use]
    pub fn context(&self) -> Option<&EncodedContext> {
        self.context.as_ref()
    }

    /// Number of encoder invocations so far
    #[must_use]
    pub fn encode_count(&self) -> usize {
        self.encode_count
    }

    /// Number of successful decodes so far
    #[must_use]
    pub fn decode_count(&self) -> usize {
        self.decode_count
    }

    /// Load the promptable model, falling back from GPU to CPU
    ///
    /// Loading twice returns the provider of the first successful load.
    ///
    /// # Errors
    /// Returns `ClearcutError::Model` when every provider fails
    pub fn load(
        &mut self,
        factory: &dyn BackendFactory<dyn PromptableBackend>,
        requested: ExecutionProvider,
    ) -> Result<ExecutionProvider> {
        if let Some(provider) = self.provider() {
            return Ok(provider);
        }

        self.state = SessionState::ModelLoading;
        let loaded = load_with_fallback(factory, requested);
        self.state = self.resting_state();

        let loaded = loaded?;
        let provider = loaded.provider;
        self.backend = Some(loaded);
        Ok(provider)
    }

    /// Encode `image` for `session` unless that session is already encoded
    ///
    /// Returns `true` when the encoder ran. Encoding a new session replaces
    /// the previous context.
    ///
    /// # Errors
    /// - Model not loaded
    /// - Encoder failures
    #[instrument(skip(self, image), fields(dimensions = %format!("{}x{}", image.width(), image.height())))]
    pub fn encode(&mut self, session: SessionId, image: &DynamicImage) -> Result<bool> {
        if self.context.as_ref().is_some_and(|c| c.session == session) {
            debug!("Embedding already cached");
            return Ok(false);
        }

        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| ClearcutError::model("Promptable model is not loaded"))?;

        self.context = None;
        self.state = SessionState::Embedding;
        let encoded = backend.backend.encode(image);
        self.encode_count += 1;

        match encoded {
            Ok(output) => {
                self.context = Some(EncodedContext {
                    session,
                    geometry: PromptGeometry {
                        original_size: (image.width(), image.height()),
                        reshaped_size: output.reshaped_size,
                        input_size: output.input_size,
                    },
                    embedding: output.embedding,
                });
                self.state = SessionState::Ready;
                if let Some(context) = &self.context {
                    info!(
                        %session,
                        original = ?context.original_size(),
                        reshaped = ?context.reshaped_size(),
                        "Image encoded"
                    );
                }
                Ok(true)
            },
            Err(e) => {
                self.state = SessionState::Idle;
                warn!(%session, error = %e, "Encoding failed");
                Err(e)
            },
        }
    }

    /// Decode the display and raw masks for the request's points
    ///
    /// The session stays usable after a failure.
    ///
    /// # Errors
    /// Returns `ClearcutError::Decode` for an unknown session, invalid
    /// controls, empty prompts or failures in the decoder
    #[instrument(skip(self, request), fields(session = %request.session, points = request.points.len()))]
    pub fn decode(&mut self, request: &DecodeRequest) -> Result<MaskResult> {
        let context = self
            .context
            .as_ref()
            .filter(|c| c.session == request.session)
            .ok_or_else(|| {
                ClearcutError::decode(format!("No encoded image for session {}", request.session))
            })?;
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| ClearcutError::decode("Promptable model is not loaded"))?;

        let options = request.options(&self.config);
        options.validate()?;
        let prompt = prepare_prompt(&request.points, &context.geometry, self.config.corner_anchors)?;

        self.state = SessionState::Decoding;
        let result = backend
            .backend
            .decode(&context.embedding, &prompt.coords, &prompt.labels)
            .and_then(|output| masks_from_output(&output, &context.geometry, &options, &self.config));
        self.state = SessionState::Ready;

        match result {
            Ok(masks) => {
                self.decode_count += 1;
                debug!(candidate = masks.candidate_index, score = masks.score, "Decoded masks");
                Ok(masks)
            },
            Err(e @ ClearcutError::Decode(_)) => Err(e),
            Err(other) => Err(ClearcutError::decode(other.to_string())),
        }
    }

    /// Drop the encoded context
    pub fn close(&mut self) {
        if let Some(context) = self.context.take() {
            debug!(session = %context.session, "Session closed");
        }
        self.state = SessionState::Idle;
    }

    fn resting_state(&self) -> SessionState {
        if self.context.is_some() {
            SessionState::Ready
        } else {
            SessionState::Idle
        }
    }
}
