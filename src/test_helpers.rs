//! Shared test utilities: synthetic images and filesystem fixtures.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let jpeg = jpeg_bytes(400, 300);
//! let (tmp, store, cache) = store_and_cache();
//! let slug = seed_origin(&store, "ab12c", b"webp");
//! ```

use crate::cache::SizeCache;
use crate::slug::Slug;
use crate::store::{ORIGINAL_VARIANT, OriginStore};
use image::{ImageEncoder, RgbImage, RgbaImage};
use tempfile::TempDir;

// =========================================================================
// Synthetic images
// =========================================================================

/// A gradient JPEG of the given size, encoded in memory.
pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new(&mut out)
        .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgb8)
        .unwrap();
    out
}

/// [`jpeg_bytes`] with an Exif APP1 segment carrying `orientation` (1–8).
///
/// The pixels stay as encoded; only the tag says how to display them.
pub fn jpeg_with_orientation(width: u32, height: u32, orientation: u16) -> Vec<u8> {
    let jpeg = jpeg_bytes(width, height);
    // Big-endian TIFF header, one IFD with a single SHORT entry (0x0112)
    let mut tiff = Vec::new();
    tiff.extend_from_slice(b"MM\x00\x2a");
    tiff.extend_from_slice(&8u32.to_be_bytes());
    tiff.extend_from_slice(&1u16.to_be_bytes());
    tiff.extend_from_slice(&0x0112u16.to_be_bytes());
    tiff.extend_from_slice(&3u16.to_be_bytes());
    tiff.extend_from_slice(&1u32.to_be_bytes());
    tiff.extend_from_slice(&orientation.to_be_bytes());
    tiff.extend_from_slice(&[0, 0]);
    tiff.extend_from_slice(&0u32.to_be_bytes());

    // After SOI and the encoder's JFIF APP0, if any
    let insert_at = if jpeg[2..4] == [0xff, 0xe0] {
        4 + u16::from_be_bytes([jpeg[4], jpeg[5]]) as usize
    } else {
        2
    };
    let payload_len = (2 + 6 + tiff.len()) as u16;
    let mut out = Vec::with_capacity(jpeg.len() + payload_len as usize + 2);
    out.extend_from_slice(&jpeg[..insert_at]);
    out.extend_from_slice(&[0xff, 0xe1]);
    out.extend_from_slice(&payload_len.to_be_bytes());
    out.extend_from_slice(b"Exif\x00\x00");
    out.extend_from_slice(&tiff);
    out.extend_from_slice(&jpeg[insert_at..]);
    out
}

/// A PNG with a real alpha channel.
pub fn png_rgba_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| {
        image::Rgba([(x % 256) as u8, 64, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut out = Vec::new();
    image::codecs::png::PngEncoder::new(&mut out)
        .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgba8)
        .unwrap();
    out
}

// =========================================================================
// Filesystem fixtures
// =========================================================================

/// An empty origin store and size cache under one temp directory.
///
/// Keep the returned `TempDir` alive for the duration of the test.
pub fn store_and_cache() -> (TempDir, OriginStore, SizeCache) {
    let tmp = TempDir::new().unwrap();
    let store = OriginStore::new(&tmp.path().join("data"));
    let cache = SizeCache::new(&tmp.path().join("cache"));
    (tmp, store, cache)
}

/// Write `data` as the origin of `slug` and return the parsed slug.
pub fn seed_origin(store: &OriginStore, slug: &str, data: &[u8]) -> Slug {
    let slug = Slug::parse(slug).unwrap_or_else(|e| panic!("bad test slug {slug:?}: {e}"));
    store.save_variant(&slug, ORIGINAL_VARIANT, data).unwrap();
    slug
}
