//! Parameter types for image operations.
//!
//! These structs describe *what* to do, not *how* to do it. They are the
//! interface between the callers that decide which encodings to produce (the
//! resize coordinator and the upload-time [`variants`](super::variants)
//! planner) and the [`backend`](super::backend) that does the pixel work.
//!
//! ## Types
//!
//! - [`Quality`]: Lossy encoding quality (1–100, default 90). Clamped on construction.
//! - [`Transform`]: Rotation, flips and crop applied before resizing.
//! - [`TranscodeParams`]: Everything needed for one WebP encoding.

use serde::{Deserialize, Serialize};

/// Quality setting for lossy WebP encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub struct Quality(u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(90)
    }
}

impl From<u32> for Quality {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl From<Quality> for u32 {
    fn from(q: Quality) -> Self {
        q.0
    }
}

/// Crop rectangle in pixels, relative to the (rotated, flipped) image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Geometric edits applied before any resize.
///
/// Applied in a fixed order: rotate, then flip, then crop. Crop coordinates
/// therefore refer to the image as the user sees it after rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Transform {
    /// Clockwise degrees. Normalised into `0..360`; only right angles rotate.
    pub rotation: i32,
    pub flip_h: bool,
    pub flip_v: bool,
    pub crop: Option<CropRect>,
}

impl Transform {
    pub fn is_identity(&self) -> bool {
        super::calculations::normalize_rotation(self.rotation) == 0
            && !self.flip_h
            && !self.flip_v
            && self.crop.is_none_or(|c| c.width == 0 || c.height == 0)
    }
}

/// Everything the backend needs to produce one WebP encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TranscodeParams {
    /// Output width. Never upscales: the effective width is
    /// `min(width, source_width)` unless `fill_height` is set.
    pub width: u32,
    /// When set, resize to cover `width x fill_height` and centre-crop to it.
    pub fill_height: Option<u32>,
    pub quality: Quality,
    pub transform: Transform,
}

impl TranscodeParams {
    /// Plain aspect-preserving downscale, the dynamic-size case.
    pub fn to_width(width: u32, quality: Quality) -> Self {
        Self {
            width,
            fill_height: None,
            quality,
            transform: Transform::default(),
        }
    }
}
