//! Upload-time pipeline: turn raw bytes into a stored slug.
//!
//! ```text
//! bytes ─► sniff ─► render presets (parallel) ─► mint slug ─► save variants
//!                                                             (original last)
//! ```
//!
//! Every file is placed with a temp-file rename. The origin is written after
//! all other variants so a slug never has an origin with missing presets.
//!
//! [`Ingester::edit`] re-runs the same rendering on a stored slug with a
//! transform. The first edit copies the origin to `backup.webp` and every edit
//! starts from that backup, so transforms never compound and
//! [`Ingester::restore`] can undo them. Rewriting the origin bumps its mtime,
//! which invalidates all cached on-demand widths for the slug.

use crate::imaging::sniff::{self, SniffError, SourceFormat};
use crate::imaging::{
    GeneratedVariant, ORIGINAL, Preset, TranscodeError, Transcoder, Transform, render_presets,
};
use crate::slug::{self, Slug};
use crate::store::{OriginStore, StoreError};
use serde::Serialize;
use std::io;
use std::time::Instant;
use thiserror::Error;

/// Candidate slugs tried before giving up.
const MINT_ATTEMPTS: u32 = 10;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Sniff(#[from] SniffError),
    #[error("transcode failed: {0}")]
    Transcode(#[from] TranscodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("no free slug after {0} attempts")]
    SlugsExhausted(u32),
    #[error("no backup to restore for {0}")]
    NoBackup(Slug),
}

/// One stored variant, as reported to the uploader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariantReport {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub bytes: usize,
    pub url: String,
}

/// Result of an ingest, edit or restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub slug: String,
    /// Detected source format. Absent for edits of stored WebP data the
    /// sniffer does not need to see.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<SourceFormat>,
    pub url: String,
    pub variants: Vec<VariantReport>,
}

/// `{base}/i/{slug}.webp` for the origin, `{base}/i/{slug}/{name}.webp` otherwise.
pub fn variant_url(base_url: &str, slug: &Slug, name: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if name == ORIGINAL {
        format!("{base}/i/{slug}.webp")
    } else {
        format!("{base}/i/{slug}/{name}.webp")
    }
}

pub struct Ingester<B> {
    store: OriginStore,
    transcoder: B,
    presets: Vec<Preset>,
    max_bytes: usize,
    base_url: String,
}

impl<B: Transcoder> Ingester<B> {
    pub fn new(store: OriginStore, transcoder: B, presets: Vec<Preset>, max_bytes: usize) -> Self {
        Self {
            store,
            transcoder,
            presets,
            max_bytes,
            base_url: String::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    pub fn store(&self) -> &OriginStore {
        &self.store
    }

    pub fn transcoder(&self) -> &B {
        &self.transcoder
    }

    /// Store a new upload under a freshly minted slug.
    pub fn ingest(&self, data: &[u8], transform: Transform) -> Result<UploadReport, IngestError> {
        let start = Instant::now();
        let format = sniff::validate(data, self.max_bytes)?;
        let variants = render_presets(&self.transcoder, data, &self.presets, transform)?;

        let slug = slug::mint(data, MINT_ATTEMPTS, |s| self.store.exists(s))
            .ok_or(IngestError::SlugsExhausted(MINT_ATTEMPTS))?;
        if let Err(e) = self.save_all(&slug, &variants) {
            // Never leave a half-populated slug behind
            let _ = self.store.delete(&slug);
            return Err(e.into());
        }

        tracing::info!(
            slug = %slug,
            format = format.mime(),
            bytes = data.len(),
            variants = variants.len(),
            dur_ms = start.elapsed().as_millis() as u64,
            "image stored"
        );
        Ok(self.report(&slug, Some(format), &variants))
    }

    /// Re-render a stored slug with `transform`, starting from its backup.
    pub fn edit(&self, slug: &Slug, transform: Transform) -> Result<UploadReport, IngestError> {
        let source = if self.store.has_backup(slug) {
            self.store.read_backup(slug)?
        } else {
            self.store.save_backup(slug)?;
            self.store.read_origin(slug)?
        };
        let variants = render_presets(&self.transcoder, &source, &self.presets, transform)?;
        self.save_all(slug, &variants)?;
        tracing::info!(slug = %slug, rotation = transform.rotation, "image edited");
        Ok(self.report(slug, sniff::detect(&source), &variants))
    }

    /// Re-render a stored slug from its backup with no transform.
    pub fn restore(&self, slug: &Slug) -> Result<UploadReport, IngestError> {
        if !self.store.exists(slug) {
            return Err(StoreError::NotFound(slug.clone()).into());
        }
        if !self.store.has_backup(slug) {
            return Err(IngestError::NoBackup(slug.clone()));
        }
        let source = self.store.read_backup(slug)?;
        let variants = render_presets(&self.transcoder, &source, &self.presets, Transform::default())?;
        self.save_all(slug, &variants)?;
        tracing::info!(slug = %slug, "image restored");
        Ok(self.report(slug, sniff::detect(&source), &variants))
    }

    fn save_all(&self, slug: &Slug, variants: &[GeneratedVariant]) -> io::Result<()> {
        let (origin, rest): (Vec<_>, Vec<_>) = variants.iter().partition(|v| v.name == ORIGINAL);
        for v in rest.into_iter().chain(origin) {
            self.store.save_variant(slug, &v.name, &v.encoded.data)?;
        }
        Ok(())
    }

    fn report(
        &self,
        slug: &Slug,
        format: Option<SourceFormat>,
        variants: &[GeneratedVariant],
    ) -> UploadReport {
        UploadReport {
            slug: slug.to_string(),
            format,
            url: variant_url(&self.base_url, slug, ORIGINAL),
            variants: variants
                .iter()
                .map(|v| VariantReport {
                    name: v.name.clone(),
                    width: v.encoded.width,
                    height: v.encoded.height,
                    bytes: v.encoded.data.len(),
                    url: variant_url(&self.base_url, slug, &v.name),
                })
                .collect(),
        }
    }
}
