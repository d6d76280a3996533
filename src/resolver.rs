//! Size resolver: URL path → image bytes.
//!
//! Accepted forms below `/i/`:
//!
//! | Path | Serves |
//! |---|---|
//! | `{slug}.webp` | origin |
//! | `{slug}/original`, `{slug}/max` | origin |
//! | `{slug}/{width}` with width on the allow-list | [`ResizeCoordinator`] |
//! | `{slug}/{preset}` | precomputed variant |
//!
//! Every token may carry a `.webp` suffix. A dynamic width shadows a preset
//! of the same name. Everything else is not found.

use crate::coordinator::{ImageBody, Outcome, ResizeCoordinator, ResizeError};
use crate::imaging::{ORIGINAL, Preset, TranscodeError, Transcoder};
use crate::slug::Slug;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use thiserror::Error;

pub const CONTENT_TYPE: &str = "image/webp";
pub const CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

const WEBP_SUFFIX: &str = ".webp";
pub const MAX_ALIAS: &str = "max";

#[derive(Error, Debug, Clone)]
pub enum ResolveError {
    #[error("malformed image path")]
    BadPath,
    #[error("unsupported size: {0}")]
    Unsupported(String),
    #[error("image not found: {0}")]
    NotFound(Slug),
    #[error("transcode failed: {0}")]
    Transcode(Arc<TranscodeError>),
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),
}

impl ResolveError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadPath | Self::Unsupported(_) | Self::NotFound(_) => 404,
            Self::Transcode(_) | Self::Io(_) => 500,
        }
    }
}

impl From<ResizeError> for ResolveError {
    fn from(err: ResizeError) -> Self {
        match err {
            ResizeError::NotFound(slug) => Self::NotFound(slug),
            ResizeError::Transcode(e) => Self::Transcode(e),
        }
    }
}

/// What a size token refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeToken {
    Original,
    Width(u32),
    Preset(String),
}

/// Split a path below `/i/` into slug and size token.
pub fn parse_path(path: &str) -> Result<(Slug, String), ResolveError> {
    let path = path.trim_start_matches('/');
    let parts: Vec<&str> = path.split('/').collect();
    let (slug_part, token) = match parts.as_slice() {
        [single] => {
            let slug = single
                .strip_suffix(WEBP_SUFFIX)
                .ok_or(ResolveError::BadPath)?;
            (slug, ORIGINAL)
        }
        [slug, token] => (
            slug.strip_suffix(WEBP_SUFFIX).unwrap_or(slug),
            token.strip_suffix(WEBP_SUFFIX).unwrap_or(token),
        ),
        _ => return Err(ResolveError::BadPath),
    };
    if token.is_empty() {
        return Err(ResolveError::BadPath);
    }
    let slug = Slug::parse(slug_part).map_err(|_| ResolveError::BadPath)?;
    Ok((slug, token.to_string()))
}

/// A resolved response body and how it was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub body: ImageBody,
    /// Set only for dynamic widths.
    pub outcome: Option<Outcome>,
}

/// Loaded response bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub bytes: Bytes,
    pub outcome: Option<Outcome>,
}

pub struct Resolver<B> {
    coordinator: ResizeCoordinator<B>,
    widths: Vec<u32>,
    presets: Vec<String>,
}

impl<B: Transcoder> Resolver<B> {
    pub fn new(coordinator: ResizeCoordinator<B>, widths: &[u32], presets: &[Preset]) -> Self {
        Self {
            coordinator,
            widths: widths.to_vec(),
            presets: presets
                .iter()
                .map(|p| p.name.clone())
                .filter(|name| name != ORIGINAL)
                .collect(),
        }
    }

    pub fn coordinator(&self) -> &ResizeCoordinator<B> {
        &self.coordinator
    }

    pub fn classify(&self, token: &str) -> Option<SizeToken> {
        if token == ORIGINAL || token == MAX_ALIAS {
            return Some(SizeToken::Original);
        }
        if let Ok(width) = token.parse::<u32>()
            && self.widths.contains(&width)
        {
            return Some(SizeToken::Width(width));
        }
        self.presets
            .iter()
            .any(|p| p == token)
            .then(|| SizeToken::Preset(token.to_string()))
    }

    /// Decide where the bytes for `token` come from.
    pub fn resolve(&self, slug: &Slug, token: &str) -> Result<Resolved, ResolveError> {
        let store = self.coordinator.store();
        let stored = |path: std::path::PathBuf| {
            if path.is_file() {
                Ok(Resolved {
                    body: ImageBody::File(path),
                    outcome: None,
                })
            } else {
                Err(ResolveError::NotFound(slug.clone()))
            }
        };
        match self.classify(token) {
            Some(SizeToken::Original) => stored(store.origin_path(slug)),
            Some(SizeToken::Preset(name)) => stored(store.variant_path(slug, &name)),
            Some(SizeToken::Width(width)) => {
                let resized = self.coordinator.resize(slug, width)?;
                Ok(Resolved {
                    body: resized.body,
                    outcome: Some(resized.outcome),
                })
            }
            None => Err(ResolveError::Unsupported(token.to_string())),
        }
    }

    /// Resolve and read the body.
    ///
    /// A file resolved from disk can be deleted before it is read; that case
    /// gets exactly one more resolution from the top.
    pub fn fetch(&self, slug: &Slug, token: &str) -> Result<Fetched, ResolveError> {
        self.fetch_with(slug, token, ImageBody::load)
    }

    fn fetch_with<L>(&self, slug: &Slug, token: &str, mut load: L) -> Result<Fetched, ResolveError>
    where
        L: FnMut(ImageBody) -> io::Result<Bytes>,
    {
        let mut retried = false;
        loop {
            let resolved = self.resolve(slug, token)?;
            match load(resolved.body) {
                Ok(bytes) => {
                    return Ok(Fetched {
                        bytes,
                        outcome: resolved.outcome,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if retried {
                        return Err(ResolveError::NotFound(slug.clone()));
                    }
                    tracing::debug!(slug = %slug, token, "file vanished before read, retrying");
                    retried = true;
                }
                Err(e) => return Err(ResolveError::Io(Arc::new(e))),
            }
        }
    }
}
