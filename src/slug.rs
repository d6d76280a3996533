//! Opaque image identifiers.
//!
//! A slug is a short lowercase alphanumeric string (5 characters for newly
//! minted images) that names one uploaded image everywhere: in URLs, in the
//! origin directory layout and in cache file names. Its first two characters
//! are the shard prefix that keeps any single directory's entry count bounded.
//!
//! Slugs arriving from URLs are validated before they touch the filesystem,
//! so a [`Slug`] can always be joined onto a path safely.

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of slugs minted by [`mint`].
pub const DEFAULT_SLUG_LEN: usize = 5;

const MIN_LEN: usize = 2;
const MAX_LEN: usize = 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlugError {
    #[error("slug must be {MIN_LEN}-{MAX_LEN} characters, got {0}")]
    Length(usize),
    #[error("slug may only contain lowercase letters and digits: {0:?}")]
    Charset(String),
}

/// Validated image identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slug(String);

impl Slug {
    pub fn parse(s: &str) -> Result<Self, SlugError> {
        if !(MIN_LEN..=MAX_LEN).contains(&s.len()) {
            return Err(SlugError::Length(s.len()));
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        {
            return Err(SlugError::Charset(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character directory shard key.
    pub fn shard(&self) -> &str {
        &self.0[..MIN_LEN]
    }
}

impl FromStr for Slug {
    type Err = SlugError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mint a slug for uploaded content.
///
/// Candidates are derived from `SHA-256(content || attempt)` so the same bytes
/// always propose the same sequence. `taken` is asked about each candidate in
/// turn and the first free one wins. Returns `None` only if every attempt in
/// `max_attempts` collided.
pub fn mint(content: &[u8], max_attempts: u32, taken: impl Fn(&Slug) -> bool) -> Option<Slug> {
    (0..max_attempts)
        .map(|attempt| candidate(content, attempt))
        .find(|slug| !taken(slug))
}

fn candidate(content: &[u8], attempt: u32) -> Slug {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hasher.update(attempt.to_le_bytes());
    let hex = format!("{:x}", hasher.finalize());
    Slug(hex[..DEFAULT_SLUG_LEN].to_string())
}
