//! Mapping between display space and natural image space
//!
//! An image shown with "contain" fitting is scaled by the limiting dimension
//! and centered, leaving margins on the other axis. Clicks inside those
//! margins do not correspond to any image pixel.

use serde::{Deserialize, Serialize};

/// Placement of a natural-size image inside a display region
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Letterbox {
    /// Scale from natural to display units
    pub scale: f32,
    /// Horizontal margin on each side, in display units
    pub offset_x: f32,
    /// Vertical margin on each side, in display units
    pub offset_y: f32,
    /// Displayed image size (width, height), in display units
    pub displayed: (f32, f32),
    /// Natural image size (width, height), in pixels
    pub natural: (f32, f32),
}

impl Letterbox {
    /// Fit an image of `natural` size into a `region` of display units
    ///
    /// Returns `None` when either size is empty.
    #[must_use]
    pub fn contain(natural: (f32, f32), region: (f32, f32)) -> Option<Self> {
        let (natural_w, natural_h) = natural;
        let (region_w, region_h) = region;
        if natural_w <= 0.0 || natural_h <= 0.0 || region_w <= 0.0 || region_h <= 0.0 {
            return None;
        }

        let image_ratio = natural_w / natural_h;
        let region_ratio = region_w / region_h;

        let (displayed_w, displayed_h) = if region_ratio > image_ratio {
            (region_h * image_ratio, region_h)
        } else {
            (region_w, region_w / image_ratio)
        };

        Some(Self {
            scale: displayed_w / natural_w,
            offset_x: (region_w - displayed_w) / 2.0,
            offset_y: (region_h - displayed_h) / 2.0,
            displayed: (displayed_w, displayed_h),
            natural,
        })
    }

    /// Convert a display-space position to natural image coordinates
    ///
    /// Positions in the letterbox margins return `None`.
    #[must_use]
    pub fn display_to_natural(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let local_x = x - self.offset_x;
        let local_y = y - self.offset_y;
        let (displayed_w, displayed_h) = self.displayed;
        if local_x < 0.0 || local_y < 0.0 || local_x > displayed_w || local_y > displayed_h {
            return None;
        }
        Some((
            local_x * self.natural.0 / displayed_w,
            local_y * self.natural.1 / displayed_h,
        ))
    }

    /// Convert natural image coordinates to a display-space position
    #[must_use]
    pub fn natural_to_display(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.offset_x + x / self.natural.0 * self.displayed.0,
            self.offset_y + y / self.natural.1 * self.displayed.1,
        )
    }
}

/// One-shot helper: map a click in a region showing an image with "contain" fitting
#[must_use]
pub fn map_display_to_natural(
    click: (f32, f32),
    natural: (f32, f32),
    region: (f32, f32),
) -> Option<(f32, f32)> {
    Letterbox::contain(natural, region)?.display_to_natural(click.0, click.1)
}

/// One-shot helper: where a natural-space point is drawn in the display region
#[must_use]
pub fn map_natural_to_display(
    point: (f32, f32),
    natural: (f32, f32),
    region: (f32, f32),
) -> Option<(f32, f32)> {
    Letterbox::contain(natural, region).map(|lb| lb.natural_to_display(point.0, point.1))
}
