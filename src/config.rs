//! Configuration types for matting and interactive segmentation

use crate::error::{ClearcutError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Execution provider options for model backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    /// Try GPU acceleration first, fall back to CPU on failure
    Auto,
    /// GPU acceleration only (CUDA or `CoreML`)
    Gpu,
    /// CPU execution (always available)
    Cpu,
}

impl ExecutionProvider {
    /// Providers to attempt, in order, when loading a model
    #[must_use]
    pub fn attempt_order(self) -> &'static [ExecutionProvider] {
        match self {
            Self::Auto => &[Self::Gpu, Self::Cpu],
            Self::Gpu => &[Self::Gpu],
            Self::Cpu => &[Self::Cpu],
        }
    }
}

impl Default for ExecutionProvider {
    fn default() -> Self {
        Self::Auto
    }
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Gpu => write!(f, "gpu"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

impl FromStr for ExecutionProvider {
    type Err = ClearcutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "gpu" | "cuda" | "coreml" | "webgpu" => Ok(Self::Gpu),
            "cpu" | "wasm" => Ok(Self::Cpu),
            other => Err(ClearcutError::invalid_config(format!(
                "Unknown execution provider '{}' (expected auto, gpu or cpu)",
                other
            ))),
        }
    }
}

/// Output raster formats. Every variant is lossless and keeps the alpha channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// PNG with alpha channel transparency
    Png,
    /// TIFF with alpha channel transparency
    Tiff,
    /// Lossless WebP with alpha channel transparency
    WebP,
    /// Raw RGBA8 pixel data (4 bytes per pixel)
    Rgba8,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Png
    }
}

impl OutputFormat {
    /// File extension for this format
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Tiff => "tiff",
            Self::WebP => "webp",
            Self::Rgba8 => "rgba",
        }
    }
}

/// Configuration for the guided-filter matting compositor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MattingConfig {
    /// Guided filter regularization; near zero follows guide edges tightly
    pub epsilon: f32,

    /// Fixed filter radius; `None` derives it from the image size
    pub radius: Option<usize>,

    /// Divisor applied to the shorter image side for the adaptive radius
    pub radius_divisor: usize,

    /// Lower bound for the adaptive radius
    pub min_radius: usize,

    /// Refined alpha below this value is forced to exactly zero
    pub alpha_floor: f32,

    /// Encoding of the composed result
    pub output_format: OutputFormat,
}

impl Default for MattingConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-4,
            radius: None,
            radius_divisor: 150,
            min_radius: 2,
            alpha_floor: 0.20,
            output_format: OutputFormat::Png,
        }
    }
}

impl MattingConfig {
    /// Create a new configuration builder
    #[must_use]
    pub fn builder() -> MattingConfigBuilder {
        MattingConfigBuilder::default()
    }

    /// Filter radius for an image of the given size
    #[must_use]
    pub fn radius_for(&self, width: u32, height: u32) -> usize {
        self.radius.unwrap_or_else(|| {
            crate::filter::adaptive_radius(width, height, self.radius_divisor, self.min_radius)
        })
    }

    /// Validate all configuration parameters
    ///
    /// # Errors
    /// - Non-finite or negative epsilon
    /// - Alpha floor outside 0.0-1.0
    /// - Zero radius divisor
    pub fn validate(&self) -> Result<()> {
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(ClearcutError::config_value_error(
                "epsilon",
                self.epsilon,
                ">= 0.0",
                Some(1e-4),
            ));
        }
        if !(0.0..=1.0).contains(&self.alpha_floor) {
            return Err(ClearcutError::config_value_error(
                "alpha floor",
                self.alpha_floor,
                "0.0-1.0",
                Some(0.20),
            ));
        }
        if self.radius_divisor == 0 {
            return Err(ClearcutError::config_value_error(
                "radius divisor",
                self.radius_divisor,
                ">= 1",
                Some(150),
            ));
        }
        Ok(())
    }
}

/// Builder for `MattingConfig`
#[derive(Debug, Default)]
pub struct MattingConfigBuilder {
    config: MattingConfig,
}

impl MattingConfigBuilder {
    #[must_use]
    pub fn epsilon(mut self, epsilon: f32) -> Self {
        self.config.epsilon = epsilon;
        self
    }

    #[must_use]
    pub fn radius(mut self, radius: usize) -> Self {
        self.config.radius = Some(radius);
        self
    }

    #[must_use]
    pub fn adaptive_radius(mut self, divisor: usize, min_radius: usize) -> Self {
        self.config.radius = None;
        self.config.radius_divisor = divisor;
        self.config.min_radius = min_radius;
        self
    }

    #[must_use]
    pub fn alpha_floor(mut self, floor: f32) -> Self {
        self.config.alpha_floor = floor;
        self
    }

    #[must_use]
    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.config.output_format = format;
        self
    }

    /// Build the matting configuration
    ///
    /// # Errors
    /// Returns `ClearcutError::InvalidConfig` when validation fails
    pub fn build(self) -> Result<MattingConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Probability thresholds used when turning decoder logits into masks
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaskThresholds {
    /// Below this probability a pixel is marked for removal
    pub decision: f32,
    /// At or above this probability the raw mask is fully transparent
    pub feather_end: f32,
}

impl Default for MaskThresholds {
    fn default() -> Self {
        Self {
            decision: 0.55,
            feather_end: 0.70,
        }
    }
}

/// Configuration for the interactive point-prompt session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationConfig {
    /// Probability thresholds for display and raw masks
    pub thresholds: MaskThresholds,

    /// RGBA tint applied to the "will be removed" region of the display mask
    pub overlay_color: [u8; 4],

    /// Logit shift between sensitivity 0.0 and 1.0
    pub sensitivity_span: f32,

    /// Quiet period before a pending decode runs
    pub debounce_ms: u64,

    /// Append remove-labelled corner points when no remove point exists
    pub corner_anchors: bool,

    /// Sensitivity used when a request does not carry one
    pub default_sensitivity: f32,

    /// Smoothness used when a request does not carry one
    pub default_smoothness: f32,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            thresholds: MaskThresholds::default(),
            overlay_color: [168, 85, 247, 120],
            sensitivity_span: 8.0,
            debounce_ms: 150,
            corner_anchors: true,
            default_sensitivity: 0.5,
            default_smoothness: 0.5,
        }
    }
}

impl SegmentationConfig {
    /// Create a new configuration builder
    #[must_use]
    pub fn builder() -> SegmentationConfigBuilder {
        SegmentationConfigBuilder::default()
    }

    /// Debounce window as a `Duration`
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Validate all configuration parameters
    ///
    /// # Errors
    /// - Thresholds outside (0, 1) or not strictly ordered
    /// - Defaults outside 0.0-1.0
    pub fn validate(&self) -> Result<()> {
        let MaskThresholds {
            decision,
            feather_end,
        } = self.thresholds;
        if !(decision > 0.0 && decision < 1.0) {
            return Err(ClearcutError::config_value_error(
                "decision threshold",
                decision,
                "0.0-1.0 (exclusive)",
                Some(0.55),
            ));
        }
        if !(feather_end > decision && feather_end <= 1.0) {
            return Err(ClearcutError::config_value_error(
                "feather end",
                feather_end,
                "above decision threshold, at most 1.0",
                Some(0.70),
            ));
        }
        if !self.sensitivity_span.is_finite() || self.sensitivity_span < 0.0 {
            return Err(ClearcutError::config_value_error(
                "sensitivity span",
                self.sensitivity_span,
                ">= 0.0",
                Some(8.0),
            ));
        }
        for (name, value) in [
            ("default sensitivity", self.default_sensitivity),
            ("default smoothness", self.default_smoothness),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ClearcutError::config_value_error(
                    name,
                    value,
                    "0.0-1.0",
                    Some(0.5),
                ));
            }
        }
        Ok(())
    }
}

/// Builder for `SegmentationConfig`
#[derive(Debug, Default)]
pub struct SegmentationConfigBuilder {
    config: SegmentationConfig,
}

impl SegmentationConfigBuilder {
    #[must_use]
    pub fn thresholds(mut self, decision: f32, feather_end: f32) -> Self {
        self.config.thresholds = MaskThresholds {
            decision,
            feather_end,
        };
        self
    }

    #[must_use]
    pub fn overlay_color(mut self, rgba: [u8; 4]) -> Self {
        self.config.overlay_color = rgba;
        self
    }

    #[must_use]
    pub fn sensitivity_span(mut self, span: f32) -> Self {
        self.config.sensitivity_span = span;
        self
    }

    #[must_use]
    pub fn debounce_ms(mut self, millis: u64) -> Self {
        self.config.debounce_ms = millis;
        self
    }

    #[must_use]
    pub fn corner_anchors(mut self, enabled: bool) -> Self {
        self.config.corner_anchors = enabled;
        self
    }

    /// Build the segmentation configuration
    ///
    /// # Errors
    /// Returns `ClearcutError::InvalidConfig` when validation fails
    pub fn build(self) -> Result<SegmentationConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration shared by the worker hosts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bounded capacity of command and status channels
    pub channel_capacity: usize,

    /// Provider requested when a worker loads its model
    pub execution_provider: ExecutionProvider,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 32,
            execution_provider: ExecutionProvider::Auto,
        }
    }
}

impl CoordinatorConfig {
    /// # Errors
    /// Returns `ClearcutError::InvalidConfig` for a zero channel capacity
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(ClearcutError::config_value_error(
                "channel capacity",
                self.channel_capacity,
                ">= 1",
                Some(32),
            ));
        }
        Ok(())
    }
}
