//! Pure Rust transcoding backend.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, GIF, WebP) | `image::ImageReader` decoder, EXIF orientation applied |
//! | Decode (AVIF) | `avif-parse` (container) + `rav1d` (AV1 decode), see [`avif`](super::avif) |
//! | Rotate / flip / crop | `image::DynamicImage::{rotate90, fliph, crop_imm, ..}` |
//! | Resize | `resize_exact` with `Lanczos3`, or `resize_to_fill` for thumbnails |
//! | Encode → WebP | `webp` crate (libwebp, lossy) |
//!
//! Encoding from decoded pixels drops every EXIF/XMP/ICC chunk of the source,
//! which is what keeps embedded payloads out of served files. The EXIF
//! orientation is therefore baked into the pixels at decode time; nothing
//! downstream could recover it.

use super::avif;
use super::backend::{Dimensions, Encoded, TranscodeError, Transcoder};
use super::calculations::{clamp_crop, fit_to_width, normalize_rotation};
use super::params::{Quality, TranscodeParams, Transform};
use super::sniff::{self, SourceFormat};
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageReader};
use std::io::Cursor;

/// Pure Rust backend using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
pub struct RustBackend;

impl RustBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RustBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn is_avif(data: &[u8]) -> bool {
    sniff::detect(data) == Some(SourceFormat::Avif)
}

fn decode(data: &[u8]) -> Result<DynamicImage, TranscodeError> {
    if data.is_empty() {
        return Err(TranscodeError::Empty);
    }
    if is_avif(data) {
        return avif::decode(data);
    }
    let mut decoder = ImageReader::new(Cursor::new(data))
        .with_guessed_format()?
        .into_decoder()
        .map_err(|e| TranscodeError::Decode(e.to_string()))?;
    // Unreadable EXIF is treated as upright
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut img =
        DynamicImage::from_decoder(decoder).map_err(|e| TranscodeError::Decode(e.to_string()))?;
    img.apply_orientation(orientation);
    Ok(img)
}

/// Orientations that turn the stored pixel grid by a quarter.
fn swaps_axes(orientation: Orientation) -> bool {
    matches!(
        orientation,
        Orientation::Rotate90
            | Orientation::Rotate270
            | Orientation::Rotate90FlipH
            | Orientation::Rotate270FlipH
    )
}

fn apply_transform(img: DynamicImage, transform: &Transform) -> DynamicImage {
    let img = match normalize_rotation(transform.rotation) {
        90 => img.rotate90(),
        180 => img.rotate180(),
        270 => img.rotate270(),
        _ => img,
    };
    let img = if transform.flip_h { img.fliph() } else { img };
    let img = if transform.flip_v { img.flipv() } else { img };
    match transform
        .crop
        .and_then(|c| clamp_crop(c, (img.width(), img.height())))
    {
        Some(c) => img.crop_imm(c.x, c.y, c.width, c.height),
        None => img,
    }
}

fn resize(img: DynamicImage, params: &TranscodeParams) -> DynamicImage {
    if let Some(fill_height) = params.fill_height {
        return img.resize_to_fill(params.width, fill_height, FilterType::Lanczos3);
    }
    let source = (img.width(), img.height());
    let (w, h) = fit_to_width(source, params.width);
    if (w, h) == source {
        img
    } else {
        img.resize_exact(w, h, FilterType::Lanczos3)
    }
}

/// Lossy WebP encode. libwebp only takes 8-bit RGB(A) buffers.
fn encode_webp(img: &DynamicImage, quality: Quality) -> Result<Vec<u8>, TranscodeError> {
    let (w, h) = (img.width(), img.height());
    let q = quality.value() as f32;
    let encoded = if img.color().has_alpha() {
        let rgba = img.to_rgba8();
        webp::Encoder::from_rgba(rgba.as_raw(), w, h).encode_simple(false, q)
    } else {
        let rgb = img.to_rgb8();
        webp::Encoder::from_rgb(rgb.as_raw(), w, h).encode_simple(false, q)
    };
    encoded
        .map(|mem| mem.to_vec())
        .map_err(|e| TranscodeError::Encode(format!("{e:?}")))
}

impl Transcoder for RustBackend {
    fn probe_size(&self, data: &[u8]) -> Result<Dimensions, TranscodeError> {
        if data.is_empty() {
            return Err(TranscodeError::Empty);
        }
        if is_avif(data) {
            return avif::identify(data);
        }
        let mut decoder = ImageReader::new(Cursor::new(data))
            .with_guessed_format()?
            .into_decoder()
            .map_err(|e| TranscodeError::Decode(e.to_string()))?;
        let (width, height) = decoder.dimensions();
        let upright = !decoder.orientation().is_ok_and(swaps_axes);
        Ok(if upright {
            Dimensions { width, height }
        } else {
            Dimensions {
                width: height,
                height: width,
            }
        })
    }

    fn transcode(&self, data: &[u8], params: &TranscodeParams) -> Result<Encoded, TranscodeError> {
        if params.width == 0 || params.fill_height == Some(0) {
            return Err(TranscodeError::Encode("target size must be positive".into()));
        }
        let img = apply_transform(decode(data)?, &params.transform);
        let out = resize(img, params);
        Ok(Encoded {
            data: encode_webp(&out, params.quality)?,
            width: out.width(),
            height: out.height(),
        })
    }
}
