//! Origin store: where uploaded images live on disk.
//!
//! ```text
//! {data_dir}/images/
//! └── ab/                  # slug[0:2] shard
//!     └── ab12c/
//!         ├── original.webp    # authoritative source, mtime = cache clock
//!         ├── 1920.webp        # precomputed presets
//!         ├── 200.webp
//!         ├── thumb.webp
//!         └── backup.webp      # pre-edit copy, only after an edit
//! ```
//!
//! Read-side methods are plain path and metadata accessors with no caching:
//! the disk-quota daemon may delete a slug directory at any moment, so every
//! call re-stats. Write-side methods are used only by [`ingest`](crate::ingest)
//! and always write to a temporary name first, then rename into place, so a
//! reader never observes a partially written file.

use crate::slug::Slug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// Variant name of the authoritative source.
pub const ORIGINAL_VARIANT: &str = "original";

/// Variant name of the pre-edit copy kept for `restore`.
pub const BACKUP_VARIANT: &str = "backup";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("image not found: {0}")]
    NotFound(Slug),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Classify an I/O error for `slug`, folding "not found" into [`StoreError::NotFound`].
    pub fn from_io(slug: &Slug, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::NotFound(slug.clone())
        } else {
            Self::Io(err)
        }
    }
}

#[derive(Debug, Clone)]
pub struct OriginStore {
    root: PathBuf,
}

impl OriginStore {
    /// Store rooted at `{data_dir}/images`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("images"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir_path(&self, slug: &Slug) -> PathBuf {
        self.root.join(slug.shard()).join(slug.as_str())
    }

    /// `{root}/{slug[0:2]}/{slug}/{variant}.webp`
    pub fn variant_path(&self, slug: &Slug, variant: &str) -> PathBuf {
        self.dir_path(slug).join(format!("{variant}.webp"))
    }

    pub fn origin_path(&self, slug: &Slug) -> PathBuf {
        self.variant_path(slug, ORIGINAL_VARIANT)
    }

    /// Modification time of the origin file.
    pub fn origin_mod_time(&self, slug: &Slug) -> Result<SystemTime, StoreError> {
        fs::metadata(self.origin_path(slug))
            .and_then(|m| m.modified())
            .map_err(|e| StoreError::from_io(slug, e))
    }

    pub fn read_origin(&self, slug: &Slug) -> Result<Vec<u8>, StoreError> {
        fs::read(self.origin_path(slug)).map_err(|e| StoreError::from_io(slug, e))
    }

    pub fn exists(&self, slug: &Slug) -> bool {
        self.dir_path(slug).is_dir()
    }

    /// Atomically write one variant file, creating the slug directory.
    pub fn save_variant(&self, slug: &Slug, variant: &str, data: &[u8]) -> io::Result<()> {
        write_atomic(&self.variant_path(slug, variant), data)
    }

    /// Copy the current origin to the backup slot.
    pub fn save_backup(&self, slug: &Slug) -> Result<(), StoreError> {
        let data = self.read_origin(slug)?;
        write_atomic(&self.variant_path(slug, BACKUP_VARIANT), &data)?;
        Ok(())
    }

    pub fn has_backup(&self, slug: &Slug) -> bool {
        self.variant_path(slug, BACKUP_VARIANT).is_file()
    }

    pub fn read_backup(&self, slug: &Slug) -> Result<Vec<u8>, StoreError> {
        fs::read(self.variant_path(slug, BACKUP_VARIANT)).map_err(|e| StoreError::from_io(slug, e))
    }

    /// Remove every file of a slug.
    pub fn delete(&self, slug: &Slug) -> Result<(), StoreError> {
        fs::remove_dir_all(self.dir_path(slug)).map_err(|e| StoreError::from_io(slug, e))
    }
}

/// Suffix for in-progress writes. The janitor removes leftovers.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Write `data` to a unique temporary sibling of `path`, then rename over it.
///
/// The rename is atomic on the same filesystem, so concurrent readers see
/// either the previous file or the complete new one.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = parent.join(format!(
        ".{file_name}.{}.{}{TEMP_SUFFIX}",
        std::process::id(),
        unique_counter()
    ));

    if let Err(e) = fs::write(&tmp, data).and_then(|()| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

fn unique_counter() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
