//! Precomputed variant generation.
//!
//! At upload time every image is rendered once per [`Preset`] and the results
//! are stored permanently next to the origin. The `original` preset is the
//! authoritative source later used for on-demand resizing, so it is always
//! rendered first in the returned list.
//!
//! Rendering is parallel across presets using
//! [rayon](https://docs.rs/rayon); each preset decodes the source
//! independently, which keeps the backend stateless.

use super::backend::{Encoded, TranscodeError, Transcoder};
use super::params::{Quality, TranscodeParams, Transform};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Name of the preset holding the authoritative source.
pub const ORIGINAL: &str = "original";

/// One named, permanently stored size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Preset {
    pub name: String,
    /// Maximum output width (never upscaled), or crop width with `height`.
    pub width: u32,
    /// When set, the preset is a centre crop of exactly `width x height`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default)]
    pub quality: Quality,
}

impl Preset {
    pub fn new(name: &str, width: u32) -> Self {
        Self {
            name: name.to_string(),
            width,
            height: None,
            quality: Quality::default(),
        }
    }

    pub fn cropped(name: &str, width: u32, height: u32, quality: Quality) -> Self {
        Self {
            name: name.to_string(),
            width,
            height: Some(height),
            quality,
        }
    }
}

/// Stock preset list: original (capped at 4096), 1920, 200, and a square thumb.
pub fn default_presets() -> Vec<Preset> {
    vec![
        Preset::new(ORIGINAL, 4096),
        Preset::new("1920", 1920),
        Preset::new("200", 200),
        Preset::cropped("thumb", 150, 150, Quality::new(85)),
    ]
}

/// A rendered preset ready to be stored.
#[derive(Debug, Clone)]
pub struct GeneratedVariant {
    pub name: String,
    pub encoded: Encoded,
}

/// Plan the backend parameters for a preset without executing them.
pub fn plan_preset(preset: &Preset, transform: Transform) -> TranscodeParams {
    TranscodeParams {
        width: preset.width,
        fill_height: preset.height,
        quality: preset.quality,
        transform,
    }
}

/// Render every preset from `source`.
///
/// Fails as a whole if any preset fails; a partially rendered set is never
/// returned. Output order follows `presets`, with `original` moved to the
/// front if present.
pub fn render_presets(
    backend: &impl Transcoder,
    source: &[u8],
    presets: &[Preset],
    transform: Transform,
) -> Result<Vec<GeneratedVariant>, TranscodeError> {
    let mut variants = presets
        .par_iter()
        .map(|preset| {
            let encoded = backend.transcode(source, &plan_preset(preset, transform))?;
            Ok(GeneratedVariant {
                name: preset.name.clone(),
                encoded,
            })
        })
        .collect::<Result<Vec<_>, TranscodeError>>()?;
    variants.sort_by_key(|v| v.name != ORIGINAL);
    Ok(variants)
}
