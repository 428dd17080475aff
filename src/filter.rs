//! Separable box blur and guided filter over single-channel `f32` planes
//!
//! Buffers are row-major with `width * height` samples. Both filters run in
//! O(N) regardless of radius: each 1-D pass reads window sums off a prefix
//! sum of the line. Samples outside the image are replaced by the nearest
//! in-bounds sample, so any radius is valid.
//!
//! The guided filter follows He, Sun and Tang, "Guided Image Filtering"
//! (ECCV 2010): per window the input is modelled as `q = a * I + b`, with
//! `a = cov(I, p) / (var(I) + epsilon)` and `b = mean(p) - a * mean(I)`, and
//! the coefficients are averaged over all windows covering a pixel.

use crate::error::{ClearcutError, Result};

/// Filter radius scaled to image resolution: `max(min_radius, min(w, h) / divisor)`
#[must_use]
pub fn adaptive_radius(width: u32, height: u32, divisor: usize, min_radius: usize) -> usize {
    let shorter = width.min(height) as usize;
    (shorter / divisor.max(1)).max(min_radius)
}

/// Mean over a `(2 * radius + 1)^2` window for every pixel
///
/// # Errors
/// Returns `ClearcutError::Processing` when the buffer does not hold
/// `width * height` samples or either dimension is zero.
pub fn box_blur(buffer: &[f32], width: usize, height: usize, radius: usize) -> Result<Vec<f32>> {
    validate_plane("box_blur", buffer, width, height)?;
    if radius == 0 {
        return Ok(buffer.to_vec());
    }

    let mut prefix = Vec::with_capacity(width.max(height) + 1);
    let mut horizontal = vec![0.0_f32; buffer.len()];
    for y in 0..height {
        sliding_mean(buffer, &mut horizontal, y * width, 1, width, radius, &mut prefix);
    }

    let mut output = vec![0.0_f32; buffer.len()];
    for x in 0..width {
        sliding_mean(&horizontal, &mut output, x, width, height, radius, &mut prefix);
    }

    Ok(output)
}

/// Edge-aware refinement of `input` using the local structure of `guide`
///
/// # Errors
/// Returns `ClearcutError::Processing` for mismatched buffer sizes and
/// `ClearcutError::InvalidConfig` for a negative or non-finite epsilon.
pub fn guided_filter(
    guide: &[f32],
    input: &[f32],
    width: usize,
    height: usize,
    radius: usize,
    epsilon: f32,
) -> Result<Vec<f32>> {
    validate_plane("guided_filter guide", guide, width, height)?;
    validate_plane("guided_filter input", input, width, height)?;
    if !epsilon.is_finite() || epsilon < 0.0 {
        return Err(ClearcutError::config_value_error(
            "epsilon",
            epsilon,
            ">= 0.0",
            Some(1e-4),
        ));
    }

    let guide_sq: Vec<f32> = guide.iter().map(|i| i * i).collect();
    let guide_input: Vec<f32> = guide.iter().zip(input).map(|(i, p)| i * p).collect();

    let mean_i = box_blur(guide, width, height, radius)?;
    let mean_p = box_blur(input, width, height, radius)?;
    let corr_ii = box_blur(&guide_sq, width, height, radius)?;
    let corr_ip = box_blur(&guide_input, width, height, radius)?;

    let mut a = Vec::with_capacity(guide.len());
    let mut b = Vec::with_capacity(guide.len());
    for (((mi, mp), cii), cip) in mean_i.iter().zip(&mean_p).zip(&corr_ii).zip(&corr_ip) {
        // Rounding can push a flat window's variance slightly below zero.
        let var_i = (cii - mi * mi).max(0.0);
        let cov_ip = cip - mi * mp;
        let denominator = var_i + epsilon;
        let coefficient = if denominator > 0.0 {
            cov_ip / denominator
        } else {
            0.0
        };
        a.push(coefficient);
        b.push(mp - coefficient * mi);
    }

    let mean_a = box_blur(&a, width, height, radius)?;
    let mean_b = box_blur(&b, width, height, radius)?;

    Ok(mean_a
        .iter()
        .zip(&mean_b)
        .zip(guide)
        .map(|((ma, mb), i)| ma * i + mb)
        .collect())
}

fn validate_plane(stage: &str, buffer: &[f32], width: usize, height: usize) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(ClearcutError::processing_stage_error(
            stage,
            "plane has a zero dimension",
            Some(&format!("{}x{}", width, height)),
        ));
    }
    if buffer.len() != width * height {
        return Err(ClearcutError::processing_stage_error(
            stage,
            &format!("expected {} samples, got {}", width * height, buffer.len()),
            Some(&format!("{}x{}", width, height)),
        ));
    }
    Ok(())
}

/// One window-mean pass along a line of `len` samples spaced `stride` apart
///
/// Window sums come from a prefix sum over the line; the parts of a window
/// hanging over either end count the first or last sample once per missing
/// position. Every pixel costs O(1) for any radius, `usize::MAX` included.
#[allow(clippy::indexing_slicing)]
// Safe: `lo <= hi < len` and the caller validated the plane
fn sliding_mean(
    src: &[f32],
    dst: &mut [f32],
    start: usize,
    stride: usize,
    len: usize,
    radius: usize,
    prefix: &mut Vec<f64>,
) {
    prefix.clear();
    prefix.push(0.0);
    let mut running = 0.0_f64;
    for i in 0..len {
        running += f64::from(src[start + i * stride]);
        prefix.push(running);
    }

    let end = len - 1;
    let first = f64::from(src[start]);
    let last = f64::from(src[start + end * stride]);
    let norm = 1.0 / (2.0 * radius as f64 + 1.0);

    for i in 0..len {
        let reach = i.saturating_add(radius);
        let lo = i.saturating_sub(radius);
        let hi = reach.min(end);
        let before = radius.saturating_sub(i) as f64;
        let after = reach.saturating_sub(end) as f64;

        let sum = prefix[hi + 1] - prefix[lo] + before * first + after * last;
        dst[start + i * stride] = (sum * norm) as f32;
    }
}
