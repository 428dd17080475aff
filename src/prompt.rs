//! Point prompts to display and raw masks
//!
//! The decoder works in the promptable model's input space: the image is
//! resized so its longest side matches the model and then padded. Points are
//! scaled into that space, and the selected candidate's logits are cropped back
//! to the un-padded region and resized to the original image before they are
//! thresholded. Both output buffers come from that single probability map.

use crate::{
    config::{MaskThresholds, SegmentationConfig},
    error::{ClearcutError, Result},
    inference::DecoderOutput,
    types::{MaskResult, Point, PointLabel},
};
use image::{imageops::FilterType, ImageBuffer, Luma, Rgba, RgbaImage};
use ndarray::s;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Size metadata needed to move between image and model coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptGeometry {
    /// Source image size (width, height)
    pub original_size: (u32, u32),
    /// Size after the aspect-preserving resize, before padding
    pub reshaped_size: (u32, u32),
    /// Full model input size, padding included
    pub input_size: (u32, u32),
}

impl PromptGeometry {
    /// Scale factors from natural image coordinates to model input coordinates
    #[must_use]
    pub fn scale(&self) -> (f32, f32) {
        (
            self.reshaped_size.0 as f32 / self.original_size.0.max(1) as f32,
            self.reshaped_size.1 as f32 / self.original_size.1.max(1) as f32,
        )
    }

    /// Map a natural-space point into model input space
    #[must_use]
    pub fn to_model(&self, x: f32, y: f32) -> [f32; 2] {
        let (sx, sy) = self.scale();
        [x * sx, y * sy]
    }
}

/// Controls applied when converting logits to probabilities
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecodeOptions {
    /// 0.0-1.0; higher keeps more of the image
    pub sensitivity: f32,
    /// 0.0-1.0; higher gives a softer transition
    pub smoothness: f32,
    /// Use this candidate instead of the highest-scoring one
    pub mask_index: Option<usize>,
}

impl DecodeOptions {
    /// Defaults taken from a segmentation configuration
    #[must_use]
    pub fn from_config(config: &SegmentationConfig) -> Self {
        Self {
            sensitivity: config.default_sensitivity,
            smoothness: config.default_smoothness,
            mask_index: None,
        }
    }

    /// # Errors
    /// Returns `ClearcutError::Decode` for controls outside 0.0-1.0
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("sensitivity", self.sensitivity),
            ("smoothness", self.smoothness),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ClearcutError::decode(format!(
                    "{} must be within 0.0-1.0, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Model-space prompt ready for the decoder
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedPrompt {
    pub coords: Vec<[f32; 2]>,
    pub labels: Vec<f32>,
}

/// Scale points into model space, appending corner anchors when needed
///
/// With `corner_anchors` set and no remove-labelled point present, the four
/// image corners are added as remove points.
///
/// # Errors
/// Returns `ClearcutError::Decode` when `points` is empty
pub fn prepare_prompt(
    points: &[Point],
    geometry: &PromptGeometry,
    corner_anchors: bool,
) -> Result<PreparedPrompt> {
    if points.is_empty() {
        return Err(ClearcutError::decode("At least one point is required"));
    }

    let mut prompt_points = points.to_vec();
    if corner_anchors && !points.iter().any(|p| p.label == PointLabel::Remove) {
        let right = geometry.original_size.0.saturating_sub(1) as f32;
        let bottom = geometry.original_size.1.saturating_sub(1) as f32;
        prompt_points.extend([
            Point::remove(0.0, 0.0),
            Point::remove(right, 0.0),
            Point::remove(0.0, bottom),
            Point::remove(right, bottom),
        ]);
    }

    Ok(PreparedPrompt {
        coords: prompt_points
            .iter()
            .map(|p| geometry.to_model(p.x, p.y))
            .collect(),
        labels: prompt_points
            .iter()
            .map(|p| p.label.as_model_label())
            .collect(),
    })
}

/// Index of the candidate to use
///
/// # Errors
/// Returns `ClearcutError::Decode` for an out-of-range pinned index or when no
/// candidate has a finite score
pub fn select_candidate(scores: &[f32], pinned: Option<usize>) -> Result<usize> {
    if let Some(index) = pinned {
        if index >= scores.len() {
            return Err(ClearcutError::decode(format!(
                "Mask index {} out of range ({} candidates)",
                index,
                scores.len()
            )));
        }
        return Ok(index);
    }

    scores
        .iter()
        .enumerate()
        .filter(|(_, score)| score.is_finite())
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(index, _)| index)
        .ok_or_else(|| ClearcutError::decode("Decoder returned no usable candidate scores"))
}

/// Logistic parameters `(gain, bias)` for `p = sigmoid(gain * (z + bias))`
///
/// Sensitivity shifts the logit by `(s - 0.5) * span`; smoothness scales it by
/// `4^(1 - 2m)`, so the midpoint leaves logits untouched.
#[must_use]
pub fn logistic_params(options: &DecodeOptions, sensitivity_span: f32) -> (f32, f32) {
    let bias = (options.sensitivity - 0.5) * sensitivity_span;
    let gain = 4.0_f32.powf(1.0 - 2.0 * options.smoothness);
    (gain, bias)
}

#[inline]
fn sigmoid(z: f32) -> f32 {
    1.0 / (1.0 + (-z).exp())
}

/// Foreground probability at original image resolution
///
/// # Errors
/// - Malformed decoder output
/// - Candidate index out of range
pub fn probability_map(
    output: &DecoderOutput,
    candidate: usize,
    geometry: &PromptGeometry,
    options: &DecodeOptions,
    sensitivity_span: f32,
) -> Result<Vec<f32>> {
    output.validate()?;
    let (_, candidates, mask_h, mask_w) = output.logits.dim();
    if candidate >= candidates {
        return Err(ClearcutError::decode(format!(
            "Candidate {} out of range ({} candidates)",
            candidate, candidates
        )));
    }

    let (orig_w, orig_h) = geometry.original_size;
    if orig_w == 0 || orig_h == 0 {
        return Err(ClearcutError::decode("Encoded image has zero size"));
    }

    // Logits cover the padded input; keep only the part the image occupies.
    let valid_extent = |logit_len: usize, reshaped: u32, input: u32| -> usize {
        let ratio = reshaped as f32 / input.max(1) as f32;
        ((logit_len as f32 * ratio).round() as usize).clamp(1, logit_len)
    };
    let valid_w = valid_extent(mask_w, geometry.reshaped_size.0, geometry.input_size.0);
    let valid_h = valid_extent(mask_h, geometry.reshaped_size.1, geometry.input_size.1);

    let (gain, bias) = logistic_params(options, sensitivity_span);
    let plane = output.logits.slice(s![0, candidate, ..valid_h, ..valid_w]);
    let probabilities: Vec<f32> = plane.iter().map(|&z| sigmoid(gain * (z + bias))).collect();

    let low_res: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(valid_w as u32, valid_h as u32, probabilities)
            .ok_or_else(|| ClearcutError::internal("Probability plane size mismatch"))?;

    debug!(
        candidate,
        valid = %format!("{}x{}", valid_w, valid_h),
        target = %format!("{}x{}", orig_w, orig_h),
        gain,
        bias,
        "Upscaling probability map"
    );

    let full = if (valid_w as u32, valid_h as u32) == (orig_w, orig_h) {
        low_res
    } else {
        image::imageops::resize(&low_res, orig_w, orig_h, FilterType::Triangle)
    };
    Ok(full.into_raw())
}

/// Build the display and raw buffers from one probability map
///
/// Display: `overlay` where `p < decision`, transparent elsewhere.
/// Raw: opaque black where `p < decision`, transparent at or above
/// `feather_end`, with a linear ramp between the two.
///
/// # Errors
/// Returns `ClearcutError::Internal` when `probabilities` does not fit `size`
pub fn render_masks(
    probabilities: &[f32],
    size: (u32, u32),
    thresholds: &MaskThresholds,
    overlay: [u8; 4],
) -> Result<(RgbaImage, RgbaImage)> {
    let (width, height) = size;
    if probabilities.len() != width as usize * height as usize {
        return Err(ClearcutError::internal(format!(
            "Probability map holds {} values for {}x{}",
            probabilities.len(),
            width,
            height
        )));
    }

    let band = (thresholds.feather_end - thresholds.decision).max(f32::EPSILON);
    let mut display = RgbaImage::new(width, height);
    let mut raw = RgbaImage::new(width, height);

    for ((&p, shown), cut) in probabilities
        .iter()
        .zip(display.pixels_mut())
        .zip(raw.pixels_mut())
    {
        if p < thresholds.decision {
            *shown = Rgba(overlay);
            *cut = Rgba([0, 0, 0, 255]);
        } else if p < thresholds.feather_end {
            let opacity = 1.0 - (p - thresholds.decision) / band;
            *cut = Rgba([0, 0, 0, (opacity * 255.0).round().clamp(0.0, 255.0) as u8]);
        }
    }

    Ok((display, raw))
}

/// Full decode post-processing: pick a candidate and build the mask pair
///
/// # Errors
/// - Malformed decoder output
/// - Pinned index out of range
pub fn masks_from_output(
    output: &DecoderOutput,
    geometry: &PromptGeometry,
    options: &DecodeOptions,
    config: &SegmentationConfig,
) -> Result<MaskResult> {
    output.validate()?;
    let candidate = select_candidate(&output.scores, options.mask_index)?;
    debug!(
        candidates = output.candidate_count(),
        chosen = candidate,
        pinned = options.mask_index.is_some(),
        "Mask candidate selected"
    );
    let probabilities =
        probability_map(output, candidate, geometry, options, config.sensitivity_span)?;
    let (display, raw) = render_masks(
        &probabilities,
        geometry.original_size,
        &config.thresholds,
        config.overlay_color,
    )?;

    Ok(MaskResult {
        display,
        raw,
        candidate_index: candidate,
        score: output.scores.get(candidate).copied().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn geometry() -> PromptGeometry {
        PromptGeometry {
            original_size: (200, 100),
            reshaped_size: (64, 32),
            input_size: (64, 64),
        }
    }

    fn defaults() -> DecodeOptions {
        DecodeOptions::from_config(&SegmentationConfig::default())
    }

    #[test]
    fn test_points_are_scaled_to_model_space() {
        let prompt = prepare_prompt(&[Point::keep(100.0, 50.0)], &geometry(), false).unwrap();
        assert_eq!(prompt.coords, vec![[32.0, 16.0]]);
        assert_eq!(prompt.labels, vec![1.0]);
    }

    #[test]
    fn test_corner_anchors_added_without_remove_points() {
        let prompt = prepare_prompt(&[Point::keep(100.0, 50.0)], &geometry(), true).unwrap();
        assert_eq!(prompt.coords.len(), 5);
        assert_eq!(&prompt.labels[1..], &[0.0; 4]);
        assert_eq!(prompt.coords[1], [0.0, 0.0]);
        let (sx, sy) = geometry().scale();
        assert_eq!(prompt.coords[4], [199.0 * sx, 99.0 * sy]);
    }

    #[test]
    fn test_corner_anchors_skipped_with_remove_point() {
        let points = [Point::keep(10.0, 10.0), Point::remove(150.0, 80.0)];
        let prompt = prepare_prompt(&points, &geometry(), true).unwrap();
        assert_eq!(prompt.coords.len(), 2);
        assert_eq!(prompt.labels, vec![1.0, 0.0]);
    }

    #[test]
    fn test_empty_prompt_is_rejected() {
        assert!(matches!(
            prepare_prompt(&[], &geometry(), true),
            Err(ClearcutError::Decode(_))
        ));
    }

    #[test]
    fn test_candidate_selection() {
        assert_eq!(select_candidate(&[0.2, 0.9, 0.5], None).unwrap(), 1);
        assert_eq!(select_candidate(&[0.2, 0.9, 0.5], Some(2)).unwrap(), 2);
        assert_eq!(select_candidate(&[f32::NAN, 0.1], None).unwrap(), 1);
        assert!(matches!(
            select_candidate(&[0.2, 0.9, 0.5], Some(3)),
            Err(ClearcutError::Decode(_))
        ));
        assert!(select_candidate(&[f32::NAN], None).is_err());
    }

    #[test]
    fn test_logistic_params() {
        let (gain, bias) = logistic_params(&defaults(), 8.0);
        assert!((gain - 1.0).abs() < 1e-6);
        assert!(bias.abs() < 1e-6);

        let soft = DecodeOptions {
            smoothness: 1.0,
            ..defaults()
        };
        let sharp = DecodeOptions {
            smoothness: 0.0,
            ..defaults()
        };
        assert!(logistic_params(&soft, 8.0).0 < logistic_params(&sharp, 8.0).0);

        let keen = DecodeOptions {
            sensitivity: 1.0,
            ..defaults()
        };
        assert!((logistic_params(&keen, 8.0).1 - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_options_validation() {
        assert!(defaults().validate().is_ok());
        let bad = DecodeOptions {
            sensitivity: 1.5,
            ..defaults()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_padding_is_cropped_before_upscale() {
        // Top half holds the image, bottom half is padding with strong foreground logits.
        let mut logits = Array4::from_elem((1, 1, 16, 16), -10.0_f32);
        logits.slice_mut(s![0, 0, 8.., ..]).fill(10.0);
        let output = DecoderOutput {
            logits,
            scores: vec![0.9],
        };
        let probabilities =
            probability_map(&output, 0, &geometry(), &defaults(), 8.0).unwrap();
        assert_eq!(probabilities.len(), 200 * 100);
        assert!(probabilities.iter().all(|&p| p < 0.01));
    }

    #[test]
    fn test_render_thresholds() {
        let thresholds = MaskThresholds::default();
        let overlay = [168, 85, 247, 120];
        let (display, raw) =
            render_masks(&[0.1, 0.6, 0.9, 0.55], (4, 1), &thresholds, overlay).unwrap();

        assert_eq!(display.get_pixel(0, 0).0, overlay);
        assert_eq!(raw.get_pixel(0, 0).0, [0, 0, 0, 255]);

        assert_eq!(display.get_pixel(1, 0)[3], 0);
        let feathered = raw.get_pixel(1, 0)[3];
        assert!(feathered > 0 && feathered < 255);

        assert_eq!(display.get_pixel(2, 0)[3], 0);
        assert_eq!(raw.get_pixel(2, 0)[3], 0);

        // At the decision threshold the overlay clears while the raw ramp starts opaque.
        assert_eq!(display.get_pixel(3, 0)[3], 0);
        assert_eq!(raw.get_pixel(3, 0)[3], 255);
    }

    #[test]
    fn test_display_and_raw_agree_outside_band() {
        let config = SegmentationConfig::default();
        let logits = Array4::from_shape_fn((1, 3, 32, 32), |(_, c, y, x)| {
            (x as f32 - 16.0) * 0.7 + (y as f32 - 8.0) * 0.3 + c as f32
        });
        let output = DecoderOutput {
            logits,
            scores: vec![0.3, 0.8, 0.1],
        };
        let geometry = PromptGeometry {
            original_size: (90, 60),
            reshaped_size: (32, 21),
            input_size: (32, 32),
        };

        for sensitivity in [0.0, 0.3, 0.5, 0.9] {
            for smoothness in [0.0, 0.5, 1.0] {
                let options = DecodeOptions {
                    sensitivity,
                    smoothness,
                    mask_index: None,
                };
                let result = masks_from_output(&output, &geometry, &options, &config).unwrap();
                assert_eq!(result.candidate_index, 1);
                assert_eq!(result.dimensions(), (90, 60));

                let probabilities =
                    probability_map(&output, 1, &geometry, &options, config.sensitivity_span)
                        .unwrap();
                for ((p, shown), cut) in probabilities
                    .iter()
                    .zip(result.display.pixels())
                    .zip(result.raw.pixels())
                {
                    let in_band = *p >= config.thresholds.decision
                        && *p < config.thresholds.feather_end;
                    if !in_band {
                        let display_transparent = shown[3] == 0;
                        let raw_opaque = cut[3] == 255;
                        assert_eq!(display_transparent, !raw_opaque, "p = {p}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_pinned_index_out_of_range() {
        let output = DecoderOutput {
            logits: Array4::zeros((1, 2, 8, 8)),
            scores: vec![0.5, 0.4],
        };
        let options = DecodeOptions {
            mask_index: Some(5),
            ..defaults()
        };
        let err = masks_from_output(&output, &geometry(), &options, &SegmentationConfig::default())
            .unwrap_err();
        assert!(matches!(err, ClearcutError::Decode(_)));
    }
}
