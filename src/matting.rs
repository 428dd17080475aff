//! Matting compositor
//!
//! Turns a coarse foreground-probability mask into a full-resolution alpha
//! channel aligned with real image edges, then composes the RGBA result.
//! Soft alpha is kept as computed; only values under the configured floor
//! are cut to zero, so translucent subjects (glass, sheer fabric) survive.

use crate::{
    config::MattingConfig,
    error::{ClearcutError, Result},
    filter::guided_filter,
    inference::SegmentationBackend,
    types::{MattingResult, ProcessingTimings, SegmentationMask},
};
use image::{imageops::FilterType, DynamicImage, GrayImage, RgbImage, RgbaImage};
use instant::Instant;
use log::debug;
use tracing::{info as trace_info, instrument, span, Level};

/// Luminance weights (ITU-R BT.601)
const LUMA_WEIGHTS: [f32; 3] = [0.299, 0.587, 0.114];

/// Guided-filter based alpha refinement
#[derive(Debug, Clone)]
pub struct MattingCompositor {
    config: MattingConfig,
}

impl MattingCompositor {
    /// Create a compositor
    ///
    /// # Errors
    /// Returns `ClearcutError::InvalidConfig` when the configuration is invalid
    pub fn new(config: MattingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> &MattingConfig {
        &self.config
    }

    /// Run the segmentation model and refine its mask
    ///
    /// # Errors
    /// - Model inference failures
    /// - Malformed mask output
    #[instrument(
        skip(self, backend, image),
        fields(dimensions = %format!("{}x{}", image.width(), image.height()))
    )]
    pub fn process(
        &self,
        backend: &mut dyn SegmentationBackend,
        image: &DynamicImage,
    ) -> Result<MattingResult> {
        let total_start = Instant::now();

        let coarse = {
            let _span = span!(Level::INFO, "inference").entered();
            let inference_start = Instant::now();
            let mask = backend.segment(image)?;
            (mask, inference_start.elapsed().as_millis() as u64)
        };

        let mut result = self.compose(image, &coarse.0)?;
        result.timings.inference_ms = coarse.1;
        result.timings.total_ms = total_start.elapsed().as_millis() as u64;

        trace_info!(
            radius = result.radius,
            inference_ms = result.timings.inference_ms,
            refinement_ms = result.timings.refinement_ms,
            "Matting complete"
        );
        Ok(result)
    }

    /// Refine `mask` against `image` and compose the RGBA result
    ///
    /// # Errors
    /// - Mask with zero dimensions or a buffer that does not match them
    /// - Filter failures
    #[instrument(
        skip(self, image, mask),
        fields(
            dimensions = %format!("{}x{}", image.width(), image.height()),
            mask = %format!("{}x{}", mask.dimensions.0, mask.dimensions.1)
        )
    )]
    pub fn compose(&self, image: &DynamicImage, mask: &SegmentationMask) -> Result<MattingResult> {
        let start = Instant::now();
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        if width == 0 || height == 0 {
            return Err(ClearcutError::processing("Cannot matte an empty image"));
        }

        let radius = self.config.radius_for(width, height);
        let alpha = self.refine_alpha(&rgb, mask, radius)?;
        let composed = compose_rgba(&rgb, &alpha.data);

        let refinement_ms = start.elapsed().as_millis() as u64;
        Ok(MattingResult {
            image: composed,
            alpha,
            radius,
            timings: ProcessingTimings {
                refinement_ms,
                total_ms: refinement_ms,
                ..ProcessingTimings::default()
            },
        })
    }

    /// Full-resolution refined alpha for `image`
    ///
    /// # Errors
    /// - Malformed mask
    /// - Filter failures
    pub fn refine_alpha(
        &self,
        image: &RgbImage,
        mask: &SegmentationMask,
        radius: usize,
    ) -> Result<SegmentationMask> {
        let (width, height) = image.dimensions();
        let guide = luminance_guide(image);
        let coarse = upscale_mask(mask, width, height)?;

        let refined = {
            let _span = span!(Level::DEBUG, "guided_filter", radius, epsilon = self.config.epsilon)
                .entered();
            guided_filter(
                &guide,
                &coarse,
                width as usize,
                height as usize,
                radius,
                self.config.epsilon,
            )?
        };

        let floor = self.config.alpha_floor;
        let data: Vec<u8> = refined
            .iter()
            .map(|&q| {
                if q < floor {
                    0
                } else {
                    (q.min(1.0) * 255.0).round() as u8
                }
            })
            .collect();

        let alpha = SegmentationMask::new(data, (width, height));
        debug!(
            "Refined alpha {}x{} (radius {}, floor {}, {:.1}% foreground)",
            width,
            height,
            radius,
            floor,
            alpha.foreground_ratio() * 100.0
        );
        Ok(alpha)
    }
}

/// Luminance plane in `[0, 1]`
#[must_use]
pub fn luminance_guide(image: &RgbImage) -> Vec<f32> {
    image
        .pixels()
        .map(|p| {
            let [r, g, b] = p.0;
            (LUMA_WEIGHTS[0] * f32::from(r)
                + LUMA_WEIGHTS[1] * f32::from(g)
                + LUMA_WEIGHTS[2] * f32::from(b))
                / 255.0
        })
        .collect()
}

/// Bilinearly resize a mask to `width x height` and normalize to `[0, 1]`
///
/// # Errors
/// Returns `ClearcutError::Processing` for malformed masks
pub fn upscale_mask(mask: &SegmentationMask, width: u32, height: u32) -> Result<Vec<f32>> {
    mask.validate()
        .map_err(|e| ClearcutError::processing_stage_error("mask", &e.to_string(), None))?;

    let gray: GrayImage = if mask.dimensions == (width, height) {
        mask.to_image()?
    } else {
        image::imageops::resize(&mask.to_image()?, width, height, FilterType::Triangle)
    };

    Ok(gray.as_raw().iter().map(|&v| f32::from(v) / 255.0).collect())
}

fn compose_rgba(rgb: &RgbImage, alpha: &[u8]) -> RgbaImage {
    let (width, height) = rgb.dimensions();
    let mut data = Vec::with_capacity(alpha.len() * 4);
    for (pixel, &a) in rgb.pixels().zip(alpha) {
        data.extend_from_slice(&[pixel[0], pixel[1], pixel[2], a]);
    }
    RgbaImage::from_raw(width, height, data).unwrap_or_else(|| RgbaImage::new(width, height))
}

/// Cut `original` wherever `raw_mask` is opaque
///
/// Result alpha is `original alpha * (1 - raw alpha)`, so an opaque raw pixel
/// removes the pixel and a transparent one leaves it untouched.
///
/// # Errors
/// Returns `ClearcutError::Processing` when the sizes differ
pub fn extract_with_raw_mask(original: &RgbaImage, raw_mask: &RgbaImage) -> Result<RgbaImage> {
    if original.dimensions() != raw_mask.dimensions() {
        return Err(ClearcutError::processing_stage_error(
            "extract",
            "raw mask size does not match the image",
            Some(&format!(
                "{:?} vs {:?}",
                original.dimensions(),
                raw_mask.dimensions()
            )),
        ));
    }

    let mut output = original.clone();
    for (pixel, cut) in output.pixels_mut().zip(raw_mask.pixels()) {
        let keep = 255 - u16::from(cut[3]);
        pixel[3] = ((u16::from(pixel[3]) * keep + 127) / 255) as u8;
    }
    Ok(output)
}
