//! Image transcoding: pure Rust apart from libwebp for lossy encoding.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Sniff** | magic bytes, [`sniff`] |
//! | **Probe** | `image::ImageReader::into_dimensions`, AVIF container metadata |
//! | **Transform** | rotate / flip / crop on `DynamicImage` |
//! | **Resize → WebP** | Lanczos3 + `webp` encoder |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for dimension math (unit testable)
//! - **Parameters**: Data structures describing image operations
//! - **Backend**: [`Transcoder`] trait + [`RustBackend`]
//! - **Variants**: upload-time preset rendering on top of the backend

mod avif;
pub mod backend;
mod calculations;
mod params;
pub mod rust_backend;
pub mod sniff;
pub mod variants;

pub use backend::{Dimensions, Encoded, TranscodeError, Transcoder};
pub use calculations::{clamp_crop, fit_to_width, normalize_rotation};
pub use params::{CropRect, Quality, TranscodeParams, Transform};
pub use rust_backend::RustBackend;
pub use variants::{GeneratedVariant, ORIGINAL, Preset, default_presets, render_presets};
