//! Pure calculation functions for image dimensions.
//!
//! All functions here are pure and testable without any I/O or images.

use super::params::CropRect;

/// Output dimensions for an aspect-preserving resize to `target_width`.
///
/// Never upscales: when the source is already at most `target_width` wide the
/// source dimensions come back unchanged. Height is rounded and kept ≥ 1.
///
/// ```
/// # use dajtu::imaging::fit_to_width;
/// assert_eq!(fit_to_width((2000, 1500), 800), (800, 600));
/// assert_eq!(fit_to_width((640, 480), 800), (640, 480));
/// ```
pub fn fit_to_width(source: (u32, u32), target_width: u32) -> (u32, u32) {
    let (src_w, src_h) = source;
    if target_width >= src_w || src_w == 0 {
        return source;
    }
    let ratio = target_width as f64 / src_w as f64;
    let h = ((src_h as f64 * ratio).round() as u32).max(1);
    (target_width.max(1), h)
}

/// Normalise a rotation in degrees into `0..360`.
///
/// Only right angles are meaningful to the backend; anything else is
/// rounded down to the previous right angle.
pub fn normalize_rotation(degrees: i32) -> u32 {
    let r = degrees.rem_euclid(360) as u32;
    r - r % 90
}

/// Clamp a crop rectangle to the image bounds.
///
/// Returns `None` when nothing of the rectangle overlaps the image, or when
/// the requested area is empty (a zero width or height means "no crop").
pub fn clamp_crop(crop: CropRect, bounds: (u32, u32)) -> Option<CropRect> {
    let (img_w, img_h) = bounds;
    if crop.width == 0 || crop.height == 0 || crop.x >= img_w || crop.y >= img_h {
        return None;
    }
    Some(CropRect {
        x: crop.x,
        y: crop.y,
        width: crop.width.min(img_w - crop.x),
        height: crop.height.min(img_h - crop.y),
    })
}
