//! Size cache for dynamically requested widths.
//!
//! Transcoding is the expensive step of serving an image at a width that was
//! not precomputed at upload. This module keeps the result on disk so the
//! next request for the same (slug, width) is a plain file read.
//!
//! # Design
//!
//! ## Layout
//!
//! ```text
//! {cache_dir}/
//! └── ab/                     # slug[0:2] shard
//!     ├── ab12c_800.webp
//!     └── ab12c_1600.webp
//! ```
//!
//! File names are derived from the slug and width only, so two different keys
//! never contend on one path.
//!
//! ## Validity
//!
//! There is no manifest. A cache file is valid iff its modification time is
//! not earlier than the origin file's. Editing an image rewrites the origin
//! with a newer mtime, which implicitly invalidates every cached width; the
//! next request recomputes and overwrites. Resolution is that of the
//! filesystem clock, so a replacement within the same tick as the cache write
//! can go unnoticed.
//!
//! ## Best effort
//!
//! Nothing here is allowed to fail a request. [`SizeCache::touch`] and
//! [`SizeCache::write`] report their outcome; the coordinator logs it and
//! serves correct bytes regardless.
//!
//! ## Eviction
//!
//! Every hit refreshes the file's mtime. [`SizeCache::sweep`] (the janitor)
//! deletes files idle for longer than a configured window, plus temp files
//! left behind by interrupted writes.

use crate::slug::Slug;
use crate::store::{TEMP_SUFFIX, write_atomic};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

/// Temp files younger than this are assumed to belong to a live write.
const TEMP_GRACE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct SizeCache {
    root: PathBuf,
}

impl SizeCache {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `{root}/{slug[0:2]}/{slug}_{width}.webp`. No I/O.
    pub fn cache_path(&self, slug: &Slug, width: u32) -> PathBuf {
        self.root
            .join(slug.shard())
            .join(format!("{}_{}.webp", slug, width))
    }

    /// True iff `path` exists and is not older than `origin_mod_time`.
    ///
    /// Any stat failure, including not-found, counts as invalid.
    pub fn is_valid(&self, path: &Path, origin_mod_time: SystemTime) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .is_ok_and(|mtime| mtime >= origin_mod_time)
    }

    /// Set the file's mtime to now.
    pub fn touch(&self, path: &Path) -> io::Result<()> {
        set_mtime(path, SystemTime::now())
    }

    /// Atomically replace the cache file at `path`.
    pub fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        write_atomic(path, data)
    }

    /// Delete cache files idle longer than `max_idle`, and stale temp files.
    ///
    /// Per-file failures are counted, not returned: a file the quota daemon
    /// removed mid-walk is simply gone.
    pub fn sweep(&self, max_idle: Duration) -> SweepStats {
        let now = SystemTime::now();
        let mut stats = SweepStats::default();

        for entry in WalkDir::new(&self.root).min_depth(1).into_iter() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) if e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => {
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cache sweep walk error");
                    stats.errors += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            stats.scanned += 1;

            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let idle = meta
                .modified()
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .unwrap_or(Duration::ZERO);
            let is_temp = entry.file_name().to_string_lossy().ends_with(TEMP_SUFFIX);
            let limit = if is_temp { TEMP_GRACE.min(max_idle) } else { max_idle };
            if idle <= limit {
                continue;
            }

            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    if is_temp {
                        stats.temp_removed += 1;
                    } else {
                        stats.removed += 1;
                    }
                    stats.bytes_freed += meta.len();
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "cache sweep remove failed");
                    stats.errors += 1;
                }
            }
        }
        stats
    }
}

/// Set a file's modification time without touching its content.
pub fn set_mtime(path: &Path, time: SystemTime) -> io::Result<()> {
    fs::File::options()
        .write(true)
        .open(path)?
        .set_modified(time)
}

/// Summary of one janitor pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub scanned: u64,
    pub removed: u64,
    pub temp_removed: u64,
    pub bytes_freed: u64,
    pub errors: u64,
}

impl fmt::Display for SweepStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} removed, {} temp removed, {} KB freed ({} scanned)",
            self.removed,
            self.temp_removed,
            self.bytes_freed / 1024,
            self.scanned
        )?;
        if self.errors > 0 {
            write!(f, ", {} errors", self.errors)?;
        }
        Ok(())
    }
}

/// Running outcome counters for the resize pipeline.
///
/// Shared by every request worker, hence atomics.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    fresh: AtomicU64,
    passthrough: AtomicU64,
    coalesced: AtomicU64,
    write_failures: AtomicU64,
    failures: AtomicU64,
}

impl CacheStats {
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fresh(&self) {
        self.fresh.fetch_add(1, Ordering::Relaxed);
    }

    pub fn passthrough(&self) {
        self.passthrough.fetch_add(1, Ordering::Relaxed);
    }

    pub fn coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheCounters {
        CacheCounters {
            hits: self.hits.load(Ordering::Relaxed),
            fresh: self.fresh.load(Ordering::Relaxed),
            passthrough: self.passthrough.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheCounters {
    pub hits: u64,
    pub fresh: u64,
    pub passthrough: u64,
    pub coalesced: u64,
    pub write_failures: u64,
    pub failures: u64,
}

impl CacheCounters {
    pub fn total(&self) -> u64 {
        self.hits + self.fresh + self.passthrough + self.coalesced + self.failures
    }
}

impl fmt::Display for CacheCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.total() == 0 {
            return write!(f, "no requests");
        }
        write!(
            f,
            "{} cached, {} encoded, {} original, {} joined",
            self.hits, self.fresh, self.passthrough, self.coalesced
        )?;
        if self.failures > 0 {
            write!(f, ", {} failed", self.failures)?;
        }
        write!(f, " ({} total)", self.total())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn slug(s: &str) -> Slug {
        Slug::parse(s).unwrap()
    }

    fn ago(secs: u64) -> SystemTime {
        SystemTime::now() - Duration::from_secs(secs)
    }

    // =========================================================================
    // Paths
    // =========================================================================

    #[test]
    fn cache_path_is_sharded_and_deterministic() {
        let cache = SizeCache::new(Path::new("/cache"));
        assert_eq!(
            cache.cache_path(&slug("ab12c"), 800),
            PathBuf::from("/cache/ab/ab12c_800.webp")
        );
        assert_eq!(
            cache.cache_path(&slug("ab12c"), 800),
            cache.cache_path(&slug("ab12c"), 800)
        );
        assert_ne!(
            cache.cache_path(&slug("ab12c"), 800),
            cache.cache_path(&slug("ab12c"), 1200)
        );
    }

    // =========================================================================
    // Validity
    // =========================================================================

    #[test]
    fn missing_file_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let cache = SizeCache::new(tmp.path());
        let path = cache.cache_path(&slug("ab12c"), 800);
        assert!(!cache.is_valid(&path, SystemTime::UNIX_EPOCH));
    }

    #[test]
    fn newer_or_equal_file_is_valid() {
        let tmp = TempDir::new().unwrap();
        let cache = SizeCache::new(tmp.path());
        let path = cache.cache_path(&slug("ab12c"), 800);
        cache.write(&path, b"data").unwrap();

        let mtime = fs::metadata(&path).unwrap().modified().unwrap();
        assert!(cache.is_valid(&path, mtime));
        assert!(cache.is_valid(&path, ago(3600)));
    }

    #[test]
    fn older_file_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let cache = SizeCache::new(tmp.path());
        let path = cache.cache_path(&slug("ab12c"), 800);
        cache.write(&path, b"data").unwrap();
        set_mtime(&path, ago(3600)).unwrap();

        assert!(!cache.is_valid(&path, ago(60)));
    }

    // =========================================================================
    // Touch / write
    // =========================================================================

    #[test]
    fn touch_refreshes_mtime() {
        let tmp = TempDir::new().unwrap();
        let cache = SizeCache::new(tmp.path());
        let path = cache.cache_path(&slug("ab12c"), 800);
        cache.write(&path, b"data").unwrap();
        set_mtime(&path, ago(7200)).unwrap();

        let before = SystemTime::now() - Duration::from_secs(1);
        cache.touch(&path).unwrap();
        let mtime = fs::metadata(&path).unwrap().modified().unwrap();
        assert!(mtime >= before);
        assert_eq!(fs::read(&path).unwrap(), b"data");
    }

    #[test]
    fn touch_missing_file_reports_error() {
        let tmp = TempDir::new().unwrap();
        let cache = SizeCache::new(tmp.path());
        let err = cache
            .touch(&cache.cache_path(&slug("ab12c"), 800))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn write_creates_shard_directory() {
        let tmp = TempDir::new().unwrap();
        let cache = SizeCache::new(&tmp.path().join("nested/cache"));
        let path = cache.cache_path(&slug("xy987"), 1200);
        cache.write(&path, b"bytes").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"bytes");
        assert!(tmp.path().join("nested/cache/xy").is_dir());
    }

    #[test]
    fn write_into_unwritable_root_fails() {
        let tmp = TempDir::new().unwrap();
        // A regular file where the shard directory should be
        fs::write(tmp.path().join("ab"), b"blocker").unwrap();
        let cache = SizeCache::new(tmp.path());
        assert!(
            cache
                .write(&cache.cache_path(&slug("ab12c"), 800), b"x")
                .is_err()
        );
    }

    // =========================================================================
    // Sweep
    // =========================================================================

    #[test]
    fn sweep_removes_idle_files_only() {
        let tmp = TempDir::new().unwrap();
        let cache = SizeCache::new(tmp.path());
        let idle = cache.cache_path(&slug("ab12c"), 800);
        let fresh = cache.cache_path(&slug("ab12c"), 1200);
        cache.write(&idle, b"old").unwrap();
        cache.write(&fresh, b"new").unwrap();
        set_mtime(&idle, ago(48 * 3600)).unwrap();

        let stats = cache.sweep(Duration::from_secs(24 * 3600));
        assert_eq!(stats.scanned, 2);
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.bytes_freed, 3);
        assert!(!idle.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn sweep_removes_abandoned_temp_files() {
        let tmp = TempDir::new().unwrap();
        let cache = SizeCache::new(tmp.path());
        let shard = tmp.path().join("ab");
        fs::create_dir_all(&shard).unwrap();
        let stale = shard.join(".ab12c_800.webp.1.0.tmp");
        let live = shard.join(".ab12c_800.webp.1.1.tmp");
        fs::write(&stale, b"partial").unwrap();
        fs::write(&live, b"partial").unwrap();
        set_mtime(&stale, ago(2 * 3600)).unwrap();

        let stats = cache.sweep(Duration::from_secs(24 * 3600));
        assert_eq!(stats.temp_removed, 1);
        assert_eq!(stats.removed, 0);
        assert!(!stale.exists());
        assert!(live.exists());
    }

    #[test]
    fn sweep_of_missing_root_is_empty() {
        let tmp = TempDir::new().unwrap();
        let cache = SizeCache::new(&tmp.path().join("never-created"));
        assert_eq!(cache.sweep(Duration::ZERO), SweepStats::default());
    }

    // =========================================================================
    // Stats
    // =========================================================================

    #[test]
    fn counters_display_with_failures() {
        let stats = CacheStats::default();
        stats.hit();
        stats.hit();
        stats.fresh();
        stats.coalesced();
        stats.failure();
        assert_eq!(
            stats.snapshot().to_string(),
            "2 cached, 1 encoded, 0 original, 1 joined, 1 failed (5 total)"
        );
    }

    #[test]
    fn counters_display_empty() {
        assert_eq!(CacheStats::default().snapshot().to_string(), "no requests");
    }

    #[test]
    fn sweep_stats_display() {
        let s = SweepStats {
            scanned: 10,
            removed: 3,
            temp_removed: 1,
            bytes_freed: 4096,
            errors: 0,
        };
        assert_eq!(s.to_string(), "3 removed, 1 temp removed, 4 KB freed (10 scanned)");
    }
}
