//! Model input preparation and output conversion
//!
//! The batch segmentation model takes the image stretched to a fixed square.
//! The promptable model takes the image resized so its longest side fits the
//! input, anchored top-left, with the remainder zero-padded after
//! normalization.

use crate::{
    error::{ClearcutError, Result},
    types::SegmentationMask,
};
use image::{imageops::FilterType, DynamicImage, RgbImage};
use ndarray::{Array4, ArrayView2};
use serde::{Deserialize, Serialize};

/// How the image is fitted into the model input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResizeMode {
    /// Resize to the input size, ignoring aspect ratio
    Stretch,
    /// Scale the longest side to the input, pad the rest
    LongestSide,
}

/// Per-model preprocessing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    /// Model input size (width, height)
    pub target_size: [u32; 2],
    /// Per-channel mean applied after scaling to `[0, 1]`
    pub normalization_mean: [f32; 3],
    /// Per-channel standard deviation applied after the mean
    pub normalization_std: [f32; 3],
    pub resize: ResizeMode,
}

impl PreprocessingConfig {
    /// 1024x1024 stretch with mean 0.5 and unit std (RMBG-style)
    #[must_use]
    pub fn segmentation() -> Self {
        Self {
            target_size: [1024, 1024],
            normalization_mean: [0.5, 0.5, 0.5],
            normalization_std: [1.0, 1.0, 1.0],
            resize: ResizeMode::Stretch,
        }
    }

    /// 1024 longest side with ImageNet statistics (SAM-style)
    #[must_use]
    pub fn promptable() -> Self {
        Self {
            target_size: [1024, 1024],
            normalization_mean: [0.485, 0.456, 0.406],
            normalization_std: [0.229, 0.224, 0.225],
            resize: ResizeMode::LongestSide,
        }
    }
}

/// Tensor plus the geometry it was built with
#[derive(Debug, Clone)]
pub struct PreparedInput {
    /// NCHW tensor of `target_size`
    pub tensor: Array4<f32>,
    /// Image size inside the tensor before padding (width, height)
    pub reshaped_size: (u32, u32),
    /// Tensor spatial size (width, height)
    pub input_size: (u32, u32),
}

/// Shared image preprocessing utilities
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// Size after fitting `(width, height)` into the target per `mode`
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    // Casting is acceptable for image processing math - precision loss is expected
    #[must_use]
    pub fn reshaped_size(original: (u32, u32), target: [u32; 2], mode: ResizeMode) -> (u32, u32) {
        match mode {
            ResizeMode::Stretch => (target[0], target[1]),
            ResizeMode::LongestSide => {
                let (width, height) = original;
                let longest = width.max(height).max(1) as f32;
                let scale = (target[0].min(target[1]) as f32) / longest;
                (
                    ((width as f32 * scale).round() as u32).clamp(1, target[0]),
                    ((height as f32 * scale).round() as u32).clamp(1, target[1]),
                )
            },
        }
    }

    /// Build the model input tensor for `image`
    ///
    /// # Errors
    /// Returns `ClearcutError::Processing` for empty images or a zero target size
    pub fn preprocess(image: &DynamicImage, config: &PreprocessingConfig) -> Result<PreparedInput> {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        if width == 0 || height == 0 {
            return Err(ClearcutError::processing("Cannot preprocess an empty image"));
        }
        let [target_w, target_h] = config.target_size;
        if target_w == 0 || target_h == 0 {
            return Err(ClearcutError::processing_stage_error(
                "preprocessing",
                "model input size has a zero dimension",
                Some(&format!("{}x{}", target_w, target_h)),
            ));
        }

        let (new_w, new_h) = Self::reshaped_size((width, height), config.target_size, config.resize);
        let resized = if (new_w, new_h) == (width, height) {
            rgb
        } else {
            image::imageops::resize(&rgb, new_w, new_h, FilterType::Triangle)
        };

        Ok(PreparedInput {
            tensor: Self::canvas_to_tensor(&resized, config),
            reshaped_size: (new_w, new_h),
            input_size: (target_w, target_h),
        })
    }

    /// Normalize `canvas` into the top-left of a zeroed NCHW tensor
    fn canvas_to_tensor(canvas: &RgbImage, config: &PreprocessingConfig) -> Array4<f32> {
        let [target_w, target_h] = config.target_size;
        let mut tensor = Array4::<f32>::zeros((1, 3, target_h as usize, target_w as usize));

        #[allow(clippy::indexing_slicing)]
        // Safe: the canvas is never larger than the tensor
        for (x, y, pixel) in canvas.enumerate_pixels() {
            if x >= target_w || y >= target_h {
                continue;
            }
            for channel in 0..3 {
                tensor[[0, channel, y as usize, x as usize]] = (f32::from(pixel[channel]) / 255.0
                    - config.normalization_mean[channel])
                    / config.normalization_std[channel];
            }
        }

        tensor
    }

    /// Min-max normalize a model output plane into a mask
    ///
    /// A flat plane becomes all zeros.
    ///
    /// # Errors
    /// Returns `ClearcutError::Inference` for empty or non-finite output
    pub fn plane_to_mask(plane: ArrayView2<'_, f32>) -> Result<SegmentationMask> {
        let (height, width) = plane.dim();
        if width == 0 || height == 0 {
            return Err(ClearcutError::inference("Model returned an empty mask"));
        }

        let (min, max) = plane
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if !min.is_finite() || !max.is_finite() {
            return Err(ClearcutError::inference("Model output contains non-finite values"));
        }

        let range = max - min;
        let values: Vec<f32> = if range > f32::EPSILON {
            plane.iter().map(|&v| (v - min) / range).collect()
        } else {
            vec![0.0; width * height]
        };

        Ok(SegmentationMask::from_probabilities(
            &values,
            (width as u32, height as u32),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use ndarray::Array2;

    fn create_test_image(width: u32, height: u32) -> DynamicImage {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_pixel(width, height, Rgb([255, 0, 0]));
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_stretch_fills_input() {
        let config = PreprocessingConfig {
            target_size: [64, 64],
            ..PreprocessingConfig::segmentation()
        };
        let prepared = ImagePreprocessor::preprocess(&create_test_image(100, 50), &config).unwrap();
        assert_eq!(prepared.tensor.shape(), &[1, 3, 64, 64]);
        assert_eq!(prepared.reshaped_size, (64, 64));
        assert!((prepared.tensor[[0, 0, 63, 63]] - 0.5).abs() < 1e-6);
        assert!((prepared.tensor[[0, 1, 63, 63]] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_longest_side_pads_bottom() {
        let config = PreprocessingConfig {
            target_size: [64, 64],
            ..PreprocessingConfig::promptable()
        };
        let prepared = ImagePreprocessor::preprocess(&create_test_image(200, 100), &config).unwrap();
        assert_eq!(prepared.reshaped_size, (64, 32));
        assert_eq!(prepared.input_size, (64, 64));
        assert!(prepared.tensor[[0, 0, 10, 10]] > 2.0);
        assert_eq!(prepared.tensor[[0, 0, 40, 10]], 0.0);
    }

    #[test]
    fn test_reshaped_size_for_tall_image() {
        assert_eq!(
            ImagePreprocessor::reshaped_size((300, 1200), [1024, 1024], ResizeMode::LongestSide),
            (256, 1024)
        );
    }

    #[test]
    fn test_empty_image_is_rejected() {
        let empty = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(ImagePreprocessor::preprocess(&empty, &PreprocessingConfig::segmentation()).is_err());
    }

    #[test]
    fn test_plane_to_mask_normalizes() {
        let plane = Array2::from_shape_vec((2, 2), vec![-1.0, 0.0, 1.0, 3.0]).unwrap();
        let mask = ImagePreprocessor::plane_to_mask(plane.view()).unwrap();
        assert_eq!(mask.dimensions, (2, 2));
        assert_eq!(mask.data, vec![0, 64, 128, 255]);

        let flat = Array2::from_elem((3, 2), 0.7_f32);
        let mask = ImagePreprocessor::plane_to_mask(flat.view()).unwrap();
        assert_eq!(mask.dimensions, (2, 3));
        assert!(mask.data.iter().all(|&v| v == 0));
    }
}
