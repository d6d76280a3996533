//! Transcoder trait and shared types.
//!
//! The [`Transcoder`] trait defines the two operations every backend must
//! support: probe dimensions, and transcode raw bytes into a WebP encoding.
//! Both take bytes rather than paths: callers own file I/O so the backend stays
//! a pure function of its inputs.
//!
//! The production implementation is
//! [`RustBackend`](super::rust_backend::RustBackend).

use super::params::TranscodeParams;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("empty source image")]
    Empty,
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Result of a probe operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// A finished WebP encoding and its pixel size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Image transcoding backend.
///
/// `Send + Sync` because one instance is shared by every request worker.
pub trait Transcoder: Send + Sync {
    /// Read pixel dimensions without a full decode where the format allows.
    fn probe_size(&self, data: &[u8]) -> Result<Dimensions, TranscodeError>;

    /// Decode, transform, resize and re-encode as WebP with all metadata
    /// stripped.
    fn transcode(&self, data: &[u8], params: &TranscodeParams) -> Result<Encoded, TranscodeError>;
}
