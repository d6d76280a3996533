//! # dajtu
//!
//! An image host's storage and delivery core. Uploads are stored once as a
//! WebP origin plus a fixed set of precomputed variants; any other supported
//! width is produced on first request, cached on disk, and served from the
//! cache afterwards.
//!
//! # Architecture
//!
//! ```text
//!              ingest (upload / edit / restore)
//!                          │
//!                          ▼
//! GET /i/… ─► resolver ─► origin store ◄── disk-quota daemon may delete
//!                │
//!                ▼ dynamic width
//!           coordinator ─► flight group (one transcode per key)
//!                │
//!                ├─► size cache (mtime-validated files)
//!                └─► transcoder (decode, resize, WebP)
//! ```
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`slug`] | Image identifiers: validation, shard prefix, minting |
//! | [`imaging`] | Format sniffing, the [`Transcoder`](imaging::Transcoder) trait, the pure Rust backend, preset rendering |
//! | [`store`] | Origin store layout and atomic file placement |
//! | [`cache`] | Size cache: paths, mtime validity, touch, janitor sweep, counters |
//! | [`flight`] | Generic single-flight registry |
//! | [`coordinator`] | Cache check, single-flight transcode, best-effort cache write |
//! | [`resolver`] | URL path and size token → bytes, fixed response headers |
//! | [`server`] | axum router and blocking worker dispatch |
//! | [`ingest`] | Upload, edit and restore pipeline |
//! | [`config`] | `dajtu.toml` loading, validation, merging |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## The Filesystem Is the State
//!
//! There is no index of what is cached. A cache file is valid iff its mtime is
//! not older than the origin's, so editing an image invalidates every cached
//! width by rewriting one file. Nothing is remembered between requests: files
//! can disappear at any time (the quota daemon, the janitor) and every request
//! re-stats what it needs.
//!
//! ## One Transcode per Key
//!
//! Resizing is the only expensive operation. Concurrent requests for the same
//! `(slug, width)` are coalesced by [`flight::FlightGroup`] so a burst of
//! traffic on a freshly shared image costs one decode and one encode.
//!
//! ## Best-Effort Cache
//!
//! Cache writes and touches never fail a request. A full disk degrades to
//! serving freshly computed bytes on every request, which is slow but correct.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod flight;
pub mod imaging;
pub mod ingest;
pub mod output;
pub mod resolver;
pub mod server;
pub mod slug;
pub mod store;

#[cfg(test)]
pub(crate) mod test_helpers;
