//! Core types shared by the batch and interactive pipelines

use crate::{
    config::OutputFormat,
    error::{ClearcutError, Result},
};
use image::{GrayImage, ImageBuffer, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;
use uuid::Uuid;

/// Identity of an image in the processing queue
pub type ItemId = Uuid;

/// Identity of an interactive segmentation session
pub type SessionId = Uuid;

/// Single-channel mask with values 0-255 (255 = foreground)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationMask {
    /// Row-major mask values
    pub data: Vec<u8>,

    /// Mask dimensions (width, height)
    pub dimensions: (u32, u32),
}

impl SegmentationMask {
    /// Create a new segmentation mask
    #[must_use]
    pub fn new(data: Vec<u8>, dimensions: (u32, u32)) -> Self {
        Self { data, dimensions }
    }

    /// Create mask from a grayscale image
    #[must_use]
    pub fn from_image(image: &GrayImage) -> Self {
        Self::new(image.as_raw().clone(), image.dimensions())
    }

    /// Quantize probabilities in `[0, 1]` to a mask
    #[must_use]
    pub fn from_probabilities(values: &[f32], dimensions: (u32, u32)) -> Self {
        let data = values
            .iter()
            .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect();
        Self::new(data, dimensions)
    }

    /// Check that the buffer length matches the dimensions
    ///
    /// # Errors
    /// Returns `ClearcutError::Processing` for empty or inconsistent masks
    pub fn validate(&self) -> Result<()> {
        let (width, height) = self.dimensions;
        if width == 0 || height == 0 {
            return Err(ClearcutError::processing(format!(
                "Mask has zero dimension ({}x{})",
                width, height
            )));
        }
        let expected = width as usize * height as usize;
        if self.data.len() != expected {
            return Err(ClearcutError::processing(format!(
                "Mask shape mismatch: {}x{} needs {} values, got {}",
                width,
                height,
                expected,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Convert mask to a grayscale image
    ///
    /// # Errors
    /// Returns `ClearcutError::Processing` when the data does not fit the dimensions
    pub fn to_image(&self) -> Result<GrayImage> {
        let (width, height) = self.dimensions;
        ImageBuffer::from_raw(width, height, self.data.clone())
            .ok_or_else(|| ClearcutError::processing("Failed to create image from mask data"))
    }

    /// Fraction of pixels above half intensity
    #[must_use]
    pub fn foreground_ratio(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let foreground = self.data.iter().filter(|&&v| v > 127).count();
        foreground as f32 / self.data.len() as f32
    }
}

/// Label attached to a point prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointLabel {
    /// Region around the point should be removed
    Remove,
    /// Region around the point should be kept
    Keep,
}

impl PointLabel {
    /// Numeric label expected by promptable models (1 keep, 0 remove)
    #[must_use]
    pub fn as_model_label(self) -> f32 {
        match self {
            Self::Remove => 0.0,
            Self::Keep => 1.0,
        }
    }
}

/// Point prompt in natural image coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    pub label: PointLabel,
}

impl Point {
    #[must_use]
    pub fn keep(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            label: PointLabel::Keep,
        }
    }

    #[must_use]
    pub fn remove(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            label: PointLabel::Remove,
        }
    }
}

/// Display and raw masks produced by one decode call
///
/// The display mask tints the region that will be removed; the raw mask is
/// opaque where pixels will be cut. Both come from the same probability map.
#[derive(Debug, Clone)]
pub struct MaskResult {
    /// Overlay: tinted and semi-transparent for background, transparent for foreground
    pub display: RgbaImage,

    /// Cut mask: opaque for background, transparent for foreground
    pub raw: RgbaImage,

    /// Candidate mask that produced this result
    pub candidate_index: usize,

    /// Model confidence for the selected candidate
    pub score: f32,
}

impl MaskResult {
    /// Encode both masks losslessly, in the same call, so they stay paired
    ///
    /// # Errors
    /// Returns image encoding errors
    pub fn encode(&self, format: OutputFormat) -> Result<(Vec<u8>, Vec<u8>)> {
        Ok((
            encode_rgba(&self.display, format)?,
            encode_rgba(&self.raw, format)?,
        ))
    }

    /// Mask dimensions (width, height)
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.display.dimensions()
    }
}

/// Timing breakdown for one matting call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTimings {
    /// Model preprocessing and inference
    pub inference_ms: u64,

    /// Guide construction, mask resize and guided filter
    pub refinement_ms: u64,

    /// Result encoding
    pub encode_ms: u64,

    /// Total end-to-end processing time
    pub total_ms: u64,
}

impl ProcessingTimings {
    /// Time not covered by the measured stages
    #[must_use]
    pub fn other_overhead_ms(&self) -> u64 {
        self.total_ms
            .saturating_sub(self.inference_ms + self.refinement_ms + self.encode_ms)
    }
}

/// Output of the matting compositor
#[derive(Debug, Clone)]
pub struct MattingResult {
    /// Original RGB with the refined alpha channel
    pub image: RgbaImage,

    /// Refined full-resolution alpha
    pub alpha: SegmentationMask,

    /// Guided filter radius that was used
    pub radius: usize,

    /// Processing timings
    pub timings: ProcessingTimings,
}

impl MattingResult {
    /// Get the image as encoded bytes in the specified lossless format
    ///
    /// # Errors
    /// Returns image encoding errors
    pub fn to_bytes(&self, format: OutputFormat) -> Result<Vec<u8>> {
        encode_rgba(&self.image, format)
    }

    /// Save the result as PNG with alpha channel
    ///
    /// # Errors
    /// Returns I/O or encoding errors
    pub fn save_png<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.image.save_with_format(path, image::ImageFormat::Png)?;
        Ok(())
    }

    /// Get image dimensions
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Encode an RGBA buffer without loss
///
/// # Errors
/// Returns image encoding errors, or `UnsupportedFormat`-style configuration
/// errors when WebP support is compiled out
pub fn encode_rgba(image: &RgbaImage, format: OutputFormat) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    match format {
        OutputFormat::Png => {
            image.write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Png)?;
        },
        OutputFormat::Tiff => {
            image.write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Tiff)?;
        },
        #[cfg(feature = "webp-support")]
        OutputFormat::WebP => {
            use image::ImageEncoder;
            let encoder = image::codecs::webp::WebPEncoder::new_lossless(&mut buffer);
            encoder.write_image(
                image.as_raw(),
                image.width(),
                image.height(),
                image::ExtendedColorType::Rgba8,
            )?;
        },
        #[cfg(not(feature = "webp-support"))]
        OutputFormat::WebP => {
            return Err(ClearcutError::invalid_config(
                "WebP output requires the 'webp-support' feature",
            ));
        },
        OutputFormat::Rgba8 => buffer.extend_from_slice(image.as_raw()),
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_validation() {
        assert!(SegmentationMask::new(vec![0; 6], (3, 2)).validate().is_ok());
        assert!(SegmentationMask::new(vec![0; 5], (3, 2)).validate().is_err());
        assert!(SegmentationMask::new(vec![], (0, 2)).validate().is_err());
    }

    #[test]
    fn test_mask_from_probabilities() {
        let mask = SegmentationMask::from_probabilities(&[-0.5, 0.0, 0.5, 1.0, 2.0, 1.0], (3, 2));
        assert_eq!(mask.data, vec![0, 0, 128, 255, 255, 255]);
        assert!((mask.foreground_ratio() - 4.0 / 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_point_labels() {
        assert_eq!(Point::keep(1.0, 2.0).label.as_model_label(), 1.0);
        assert_eq!(Point::remove(1.0, 2.0).label.as_model_label(), 0.0);
    }

    #[test]
    fn test_png_encoding_keeps_alpha() {
        let image = RgbaImage::from_pixel(4, 3, image::Rgba([10, 20, 30, 77]));
        let bytes = encode_rgba(&image, OutputFormat::Png).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgba8();
        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.get_pixel(2, 1).0, [10, 20, 30, 77]);
    }

    #[test]
    fn test_raw_rgba_encoding() {
        let image = RgbaImage::from_pixel(2, 2, image::Rgba([1, 2, 3, 4]));
        let bytes = encode_rgba(&image, OutputFormat::Rgba8).unwrap();
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn test_timings_overhead() {
        let timings = ProcessingTimings {
            inference_ms: 40,
            refinement_ms: 30,
            encode_ms: 10,
            total_ms: 95,
        };
        assert_eq!(timings.other_overhead_ms(), 15);
    }
}
