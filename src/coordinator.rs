//! Resize coordinator: on-demand widths, computed at most once per key.
//!
//! Per request for `(slug, width)`:
//!
//! 1. Stat the origin. Missing origin is [`ResizeError::NotFound`] even when a
//!    cache file for that width is still on disk.
//! 2. Valid cache file: touch it and serve it. No locking on this path.
//! 3. Otherwise enter the [`FlightGroup`] for the key. Followers block and
//!    adopt the leader's result, error included. The leader re-checks the
//!    cache (another leader may have just finished), then reads and probes the
//!    origin. A target at or beyond the origin width serves the origin bytes
//!    unchanged. Anything else is transcoded and written to the cache on a
//!    best-effort basis.
//!
//! State lives in the filesystem timestamps plus the ephemeral flight entry;
//! nothing about a key is remembered between requests.

use crate::cache::{CacheStats, SizeCache};
use crate::flight::{Flight, FlightGroup};
use crate::imaging::{Quality, TranscodeError, TranscodeParams, Transcoder};
use crate::slug::Slug;
use crate::store::{OriginStore, StoreError};
use bytes::Bytes;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Errors that reach the caller. Cache I/O failures never do.
///
/// `Clone` because one leader's error is handed to every waiter.
#[derive(Error, Debug, Clone)]
pub enum ResizeError {
    #[error("image not found: {0}")]
    NotFound(Slug),
    #[error("transcode failed: {0}")]
    Transcode(Arc<TranscodeError>),
}

impl ResizeError {
    fn transcode(err: TranscodeError) -> Self {
        Self::Transcode(Arc::new(err))
    }

    fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(slug) => Self::NotFound(slug),
            StoreError::Io(e) => Self::transcode(TranscodeError::Io(e)),
        }
    }
}

/// Response payload: a file to stream, or bytes already in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageBody {
    File(PathBuf),
    Bytes(Bytes),
}

impl ImageBody {
    /// Materialise the body. A `File` may have been deleted since it was
    /// resolved; that surfaces as `NotFound`.
    pub fn load(self) -> io::Result<Bytes> {
        match self {
            Self::File(path) => fs::read(path).map(Bytes::from),
            Self::Bytes(bytes) => Ok(bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    CacheHit,
    Fresh,
    Passthrough,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CacheHit => "hit",
            Self::Fresh => "miss",
            Self::Passthrough => "original",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resized {
    pub body: ImageBody,
    pub outcome: Outcome,
    /// True when another request computed this result.
    pub coalesced: bool,
}

/// Single-flight key. Structured, so no two distinct requests can collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlightKey {
    pub slug: Slug,
    pub width: u32,
}

type Shared = Result<(ImageBody, Outcome), ResizeError>;

pub struct ResizeCoordinator<B> {
    store: OriginStore,
    cache: SizeCache,
    transcoder: B,
    quality: Quality,
    flights: FlightGroup<FlightKey, Shared>,
    stats: CacheStats,
}

impl<B: Transcoder> ResizeCoordinator<B> {
    pub fn new(store: OriginStore, cache: SizeCache, transcoder: B, quality: Quality) -> Self {
        Self {
            store,
            cache,
            transcoder,
            quality,
            flights: FlightGroup::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn store(&self) -> &OriginStore {
        &self.store
    }

    pub fn cache(&self) -> &SizeCache {
        &self.cache
    }

    pub fn transcoder(&self) -> &B {
        &self.transcoder
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Serve `slug` at `width`, computing and caching it if needed.
    ///
    /// `width` must already be on the allow-list.
    pub fn resize(&self, slug: &Slug, width: u32) -> Result<Resized, ResizeError> {
        let start = Instant::now();
        let origin_mtime = self
            .store
            .origin_mod_time(slug)
            .map_err(ResizeError::from_store)?;

        let cache_path = self.cache.cache_path(slug, width);
        if self.cache.is_valid(&cache_path, origin_mtime) {
            self.touch(&cache_path);
            self.stats.hit();
            tracing::debug!(slug = %slug, width, dur_ms = elapsed_ms(start), cache = "hit", "cache hit");
            return Ok(Resized {
                body: ImageBody::File(cache_path),
                outcome: Outcome::CacheHit,
                coalesced: false,
            });
        }

        let key = FlightKey {
            slug: slug.clone(),
            width,
        };
        match self.flights.run(&key, || self.lead(slug, width, cache_path, start)) {
            Flight::Led(shared) => shared.map(|(body, outcome)| Resized {
                body,
                outcome,
                coalesced: false,
            }),
            Flight::Joined(shared) => {
                self.stats.coalesced();
                shared.map(|(body, outcome)| Resized {
                    body,
                    outcome,
                    coalesced: true,
                })
            }
            Flight::Abandoned => {
                self.stats.failure();
                tracing::error!(slug = %slug, width, "resize abandoned by panicking worker");
                Err(ResizeError::transcode(TranscodeError::Encode(
                    "resize worker panicked".into(),
                )))
            }
        }
    }

    /// The leader's half of step 3. Runs inside the flight.
    fn lead(&self, slug: &Slug, width: u32, cache_path: PathBuf, start: Instant) -> Shared {
        let origin_mtime = self
            .store
            .origin_mod_time(slug)
            .map_err(ResizeError::from_store)?;
        if self.cache.is_valid(&cache_path, origin_mtime) {
            self.touch(&cache_path);
            self.stats.hit();
            tracing::debug!(slug = %slug, width, dur_ms = elapsed_ms(start), cache = "hit", "cache hit");
            return Ok((ImageBody::File(cache_path), Outcome::CacheHit));
        }

        let source = self
            .store
            .read_origin(slug)
            .map_err(ResizeError::from_store)?;
        let result = self.compute(slug, width, source, &cache_path, start);
        if let Err(ResizeError::Transcode(e)) = &result {
            self.stats.failure();
            tracing::error!(slug = %slug, width, dur_ms = elapsed_ms(start), error = %e, "resize error");
        }
        result
    }

    fn compute(
        &self,
        slug: &Slug,
        width: u32,
        source: Vec<u8>,
        cache_path: &Path,
        start: Instant,
    ) -> Shared {
        let dims = self
            .transcoder
            .probe_size(&source)
            .map_err(ResizeError::transcode)?;
        if width >= dims.width {
            self.stats.passthrough();
            tracing::debug!(
                slug = %slug,
                width,
                origin_width = dims.width,
                cache = "original",
                "serving origin"
            );
            return Ok((ImageBody::Bytes(Bytes::from(source)), Outcome::Passthrough));
        }

        let encoded = self
            .transcoder
            .transcode(&source, &TranscodeParams::to_width(width, self.quality))
            .map_err(ResizeError::transcode)?;

        let write = match self.cache.write(cache_path, &encoded.data) {
            Ok(()) => "ok",
            Err(e) => {
                self.stats.write_failure();
                tracing::warn!(slug = %slug, width, path = %cache_path.display(), error = %e, "cache write failed");
                "failed"
            }
        };
        self.stats.fresh();
        tracing::info!(
            slug = %slug,
            width,
            out_width = encoded.width,
            out_height = encoded.height,
            dur_ms = elapsed_ms(start),
            cache = "miss",
            write,
            "resize generated"
        );
        Ok((ImageBody::Bytes(Bytes::from(encoded.data)), Outcome::Fresh))
    }

    fn touch(&self, path: &Path) {
        if let Err(e) = self.cache.touch(path) {
            tracing::warn!(path = %path.display(), error = %e, "cache touch failed");
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::set_mtime;
    use crate::imaging::backend::tests::MockTranscoder;
    use crate::store::ORIGINAL_VARIANT;
    use std::sync::Barrier;
    use std::thread;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    const ORIGIN: &[u8] = b"origin-webp-bytes";

    fn slug(s: &str) -> Slug {
        Slug::parse(s).unwrap()
    }

    fn setup(backend: MockTranscoder) -> (TempDir, ResizeCoordinator<MockTranscoder>) {
        let tmp = TempDir::new().unwrap();
        let coordinator = ResizeCoordinator::new(
            OriginStore::new(&tmp.path().join("data")),
            SizeCache::new(&tmp.path().join("cache")),
            backend,
            Quality::default(),
        );
        (tmp, coordinator)
    }

    fn put_origin(c: &ResizeCoordinator<MockTranscoder>, s: &Slug) {
        c.store().save_variant(s, ORIGINAL_VARIANT, ORIGIN).unwrap();
    }

    fn set_origin_mtime(c: &ResizeCoordinator<MockTranscoder>, s: &Slug, t: SystemTime) {
        set_mtime(&c.store().origin_path(s), t).unwrap();
    }

    fn mtime(path: &Path) -> SystemTime {
        fs::metadata(path).unwrap().modified().unwrap()
    }

    // =========================================================================
    // Outcomes
    // =========================================================================

    #[test]
    fn first_request_transcodes_and_caches() {
        let (tmp, c) = setup(MockTranscoder::with_dimensions(2000, 1000));
        let s = slug("ab12c");
        put_origin(&c, &s);

        let out = c.resize(&s, 800).unwrap();
        assert_eq!(out.outcome, Outcome::Fresh);
        assert_eq!(out.body, ImageBody::Bytes(Bytes::from_static(b"webp:800x400")));

        let cached = tmp.path().join("cache/ab/ab12c_800.webp");
        assert_eq!(fs::read(cached).unwrap(), b"webp:800x400");
        assert_eq!(c.transcoder().transcode_count(), 1);
    }

    #[test]
    fn repeated_requests_are_idempotent() {
        let (_tmp, c) = setup(MockTranscoder::with_dimensions(2000, 1000));
        let s = slug("ab12c");
        put_origin(&c, &s);

        let first = c.resize(&s, 800).unwrap().body.load().unwrap();
        for _ in 0..3 {
            let again = c.resize(&s, 800).unwrap();
            assert_eq!(again.outcome, Outcome::CacheHit);
            assert_eq!(again.body.load().unwrap(), first);
        }
        assert_eq!(c.transcoder().transcode_count(), 1);
        assert_eq!(c.stats().snapshot().hits, 3);
    }

    #[test]
    fn origin_at_or_below_target_width_passes_through() {
        let (tmp, c) = setup(MockTranscoder::with_dimensions(2000, 1000));
        let s = slug("ab12c");
        put_origin(&c, &s);

        for width in [2000, 2400] {
            let out = c.resize(&s, width).unwrap();
            assert_eq!(out.outcome, Outcome::Passthrough);
            assert_eq!(out.body.load().unwrap(), ORIGIN);
        }
        assert_eq!(c.transcoder().transcode_count(), 0);
        assert!(!tmp.path().join("cache/ab/ab12c_2400.webp").exists());
        assert!(!tmp.path().join("cache/ab/ab12c_2000.webp").exists());
    }

    #[test]
    fn two_thousand_pixel_origin_scenario() {
        let (tmp, c) = setup(MockTranscoder::with_dimensions(2000, 1500));
        let s = slug("ab12c");
        put_origin(&c, &s);

        let small = c.resize(&s, 800).unwrap();
        assert_eq!(small.body.load().unwrap(), "webp:800x600".as_bytes());
        assert!(tmp.path().join("cache/ab/ab12c_800.webp").is_file());

        let large = c.resize(&s, 2400).unwrap();
        assert_eq!(large.body.load().unwrap(), ORIGIN);
        assert!(!tmp.path().join("cache/ab/ab12c_2400.webp").exists());
    }

    // =========================================================================
    // Validity and invalidation
    // =========================================================================

    #[test]
    fn newer_origin_forces_recompute() {
        let (_tmp, c) = setup(MockTranscoder::with_dimensions(2000, 1000));
        let s = slug("ab12c");
        put_origin(&c, &s);
        set_origin_mtime(&c, &s, SystemTime::now() - Duration::from_secs(3600));
        c.resize(&s, 800).unwrap();

        // Edit: origin rewritten with a clearly newer mtime
        put_origin(&c, &s);
        set_origin_mtime(&c, &s, SystemTime::now() + Duration::from_secs(10));

        let out = c.resize(&s, 800).unwrap();
        assert_eq!(out.outcome, Outcome::Fresh);
        assert_eq!(c.transcoder().transcode_count(), 2);
    }

    #[test]
    fn cache_hit_touches_file() {
        let (_tmp, c) = setup(MockTranscoder::with_dimensions(2000, 1000));
        let s = slug("ab12c");
        put_origin(&c, &s);
        c.resize(&s, 800).unwrap();

        let path = c.cache().cache_path(&s, 800);
        set_origin_mtime(&c, &s, SystemTime::now() - Duration::from_secs(2 * 3600));
        set_mtime(&path, SystemTime::now() - Duration::from_secs(3600)).unwrap();

        let before = SystemTime::now() - Duration::from_secs(1);
        let out = c.resize(&s, 800).unwrap();
        assert_eq!(out.outcome, Outcome::CacheHit);
        assert!(mtime(&path) >= before);
    }

    #[test]
    fn missing_origin_wins_over_stale_cache_file() {
        let (_tmp, c) = setup(MockTranscoder::with_dimensions(2000, 1000));
        let s = slug("ab12c");
        put_origin(&c, &s);
        c.resize(&s, 800).unwrap();
        let path = c.cache().cache_path(&s, 800);
        set_mtime(&path, SystemTime::now() - Duration::from_secs(24 * 3600)).unwrap();

        c.store().delete(&s).unwrap();
        for width in [800, 1200, 2400] {
            assert!(matches!(c.resize(&s, width), Err(ResizeError::NotFound(_))));
        }
        assert!(path.exists());
    }

    #[test]
    fn unknown_slug_is_not_found() {
        let (_tmp, c) = setup(MockTranscoder::with_dimensions(2000, 1000));
        let err = c.resize(&slug("zz999"), 800).unwrap_err();
        assert!(matches!(err, ResizeError::NotFound(s) if s.as_str() == "zz999"));
        assert!(c.transcoder().get_operations().is_empty());
    }

    // =========================================================================
    // Failures
    // =========================================================================

    #[test]
    fn transcode_failure_is_not_cached() {
        let (_tmp, c) = setup(MockTranscoder::with_dimensions(2000, 1000).failing());
        let s = slug("ab12c");
        put_origin(&c, &s);

        assert!(matches!(c.resize(&s, 800), Err(ResizeError::Transcode(_))));
        assert!(!c.cache().cache_path(&s, 800).exists());
        assert!(matches!(c.resize(&s, 800), Err(ResizeError::Transcode(_))));
        assert_eq!(c.transcoder().transcode_count(), 2);
        assert_eq!(c.stats().snapshot().failures, 2);
    }

    #[test]
    fn cache_write_failure_still_serves_bytes() {
        let (tmp, c) = setup(MockTranscoder::with_dimensions(2000, 1000));
        let s = slug("ab12c");
        put_origin(&c, &s);
        fs::create_dir_all(tmp.path().join("cache")).unwrap();
        // A file squatting on the shard directory
        fs::write(tmp.path().join("cache/ab"), b"").unwrap();

        let out = c.resize(&s, 800).unwrap();
        assert_eq!(out.outcome, Outcome::Fresh);
        assert_eq!(out.body.load().unwrap(), "webp:800x400".as_bytes());
        assert_eq!(c.stats().snapshot().write_failures, 1);
    }

    // =========================================================================
    // Concurrency
    // =========================================================================

    fn concurrent_requests(c: &Arc<ResizeCoordinator<MockTranscoder>>, s: &Slug, width: u32, n: usize) -> Vec<Resized> {
        let barrier = Arc::new(Barrier::new(n));
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let c = Arc::clone(c);
                let s = s.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    c.resize(&s, width)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect()
    }

    #[test]
    fn concurrent_requests_transcode_once() {
        let (_tmp, c) = setup(
            MockTranscoder::with_dimensions(3000, 2000).slow(Duration::from_millis(300)),
        );
        let c = Arc::new(c);
        let s = slug("ab12c");
        put_origin(&c, &s);

        let results = concurrent_requests(&c, &s, 1600, 12);
        assert_eq!(c.transcoder().transcode_count(), 1);
        let bodies: Vec<Bytes> = results.into_iter().map(|r| r.body.load().unwrap()).collect();
        assert!(bodies.iter().all(|b| b == &bodies[0]));
        assert_eq!(c.flights.in_flight(), 0);
    }

    #[test]
    fn two_simultaneous_requests_share_one_transcode() {
        let (_tmp, c) = setup(
            MockTranscoder::with_dimensions(4000, 3000).slow(Duration::from_millis(200)),
        );
        let c = Arc::new(c);
        let s = slug("xy987");
        put_origin(&c, &s);

        let results = concurrent_requests(&c, &s, 1200, 2);
        assert_eq!(c.transcoder().transcode_count(), 1);
        let a = results[0].body.clone().load().unwrap();
        let b = results[1].body.clone().load().unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "webp:1200x900".as_bytes());
    }

    #[test]
    fn concurrent_failure_reaches_every_waiter() {
        let (_tmp, c) = setup(
            MockTranscoder::with_dimensions(3000, 2000)
                .slow(Duration::from_millis(200))
                .failing(),
        );
        let c = Arc::new(c);
        let s = slug("ab12c");
        put_origin(&c, &s);

        let barrier = Arc::new(Barrier::new(10));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let c = Arc::clone(&c);
                let s = s.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    c.resize(&s, 800)
                })
            })
            .collect();
        for h in handles {
            assert!(matches!(h.join().unwrap(), Err(ResizeError::Transcode(_))));
        }
        assert!(!c.cache().cache_path(&s, 800).exists());
        assert_eq!(c.flights.in_flight(), 0);
    }

    #[test]
    fn origin_replaced_mid_transcode_is_recomputed_next_time() {
        let (_tmp, c) = setup(
            MockTranscoder::with_dimensions(3000, 2000).slow(Duration::from_millis(300)),
        );
        let c = Arc::new(c);
        let s = slug("ab12c");
        put_origin(&c, &s);
        set_origin_mtime(&c, &s, SystemTime::now() - Duration::from_secs(3600));

        let leader = {
            let c = Arc::clone(&c);
            let s = s.clone();
            thread::spawn(move || c.resize(&s, 800))
        };
        // The transcode is recorded before the mock starts sleeping
        while c.transcoder().transcode_count() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        put_origin(&c, &s);
        set_origin_mtime(&c, &s, SystemTime::now() + Duration::from_secs(10));

        let first = leader.join().unwrap().unwrap();
        assert_eq!(first.outcome, Outcome::Fresh);
        // The stale result is still written
        assert!(c.cache().cache_path(&s, 800).is_file());

        let next = c.resize(&s, 800).unwrap();
        assert_eq!(next.outcome, Outcome::Fresh);
        assert_eq!(c.transcoder().transcode_count(), 2);
        assert_eq!(c.flights.in_flight(), 0);
    }

    #[test]
    fn different_widths_compute_independently() {
        let (_tmp, c) = setup(MockTranscoder::with_dimensions(3000, 2000));
        let s = slug("ab12c");
        put_origin(&c, &s);

        c.resize(&s, 800).unwrap();
        c.resize(&s, 1200).unwrap();
        assert_eq!(c.transcoder().transcode_count(), 2);
        assert!(c.cache().cache_path(&s, 800).is_file());
        assert!(c.cache().cache_path(&s, 1200).is_file());
    }
}
