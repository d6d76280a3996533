//! Magic-byte format detection for uploads.
//!
//! Upload bytes are never trusted by filename or declared MIME type. The
//! leading bytes decide the format, and anything unrecognised is rejected
//! before a decoder sees it.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SniffError {
    #[error("invalid image format")]
    InvalidFormat,
    #[error("file too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },
}

/// Source formats accepted on upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Jpeg,
    Png,
    Gif,
    WebP,
    Avif,
}

impl SourceFormat {
    pub fn mime(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::WebP => "image/webp",
            Self::Avif => "image/avif",
        }
    }
}

/// Smallest input that can carry any of the recognised signatures.
const MIN_LEN: usize = 12;

/// Identify the format of `data` from its signature.
pub fn detect(data: &[u8]) -> Option<SourceFormat> {
    if data.len() < MIN_LEN {
        return None;
    }
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(SourceFormat::Jpeg);
    }
    if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some(SourceFormat::Png);
    }
    if data.starts_with(b"GIF8") {
        return Some(SourceFormat::Gif);
    }
    if data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
        return Some(SourceFormat::WebP);
    }
    // ISO-BMFF: size(4) "ftyp" brand(4)
    if &data[4..8] == b"ftyp" && matches!(&data[8..12], b"avif" | b"avis" | b"mif1") {
        return Some(SourceFormat::Avif);
    }
    None
}

/// Enforce the size limit and detect the format in one step.
pub fn validate(data: &[u8], max_bytes: usize) -> Result<SourceFormat, SniffError> {
    if data.len() > max_bytes {
        return Err(SniffError::TooLarge {
            size: data.len(),
            limit: max_bytes,
        });
    }
    detect(data).ok_or(SniffError::InvalidFormat)
}
