//! CLI output formatting for the one-shot commands.
//!
//! Output is **image-centric**: the slug and its canonical URL lead, the
//! stored variants follow as indented context lines.
//!
//! # Output Format
//!
//! ## Ingest / edit / restore
//!
//! ```text
//! ab12c (jpeg) → /i/ab12c.webp
//!     original: 3000x2000, 412 KB
//!     1920: 1920x1280, 201 KB → /i/ab12c/1920.webp
//!     thumb: 150x150, 6 KB → /i/ab12c/thumb.webp
//! ```
//!
//! ## Sweep
//!
//! ```text
//! Cache sweep /tmp/dajtu-cache (idle > 72h)
//!     3 removed, 0 temp removed, 812 KB freed (41 scanned)
//! ```
//!
//! Each command has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout.

use crate::cache::SweepStats;
use crate::imaging::ORIGINAL;
use crate::ingest::UploadReport;
use std::path::Path;
use std::time::Duration;

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// Human size, KB below a megabyte.
fn format_bytes(bytes: usize) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{} KB", bytes.div_ceil(1024))
    }
}

pub fn format_upload_report(report: &UploadReport) -> Vec<String> {
    let mut lines = Vec::new();
    let header = match report.format {
        Some(format) => format!(
            "{} ({}) → {}",
            report.slug,
            format.mime().trim_start_matches("image/"),
            report.url
        ),
        None => format!("{} → {}", report.slug, report.url),
    };
    lines.push(header);
    for v in &report.variants {
        let detail = format!(
            "{}{}: {}x{}, {}",
            indent(1),
            v.name,
            v.width,
            v.height,
            format_bytes(v.bytes)
        );
        if v.name == ORIGINAL {
            lines.push(detail);
        } else {
            lines.push(format!("{} → {}", detail, v.url));
        }
    }
    lines
}

pub fn print_upload_report(report: &UploadReport) {
    for line in format_upload_report(report) {
        println!("{}", line);
    }
}

pub fn format_sweep_output(cache_dir: &Path, max_idle: Duration, stats: &SweepStats) -> Vec<String> {
    vec![
        format!(
            "Cache sweep {} (idle > {}h)",
            cache_dir.display(),
            max_idle.as_secs() / 3600
        ),
        format!("{}{}", indent(1), stats),
    ]
}

pub fn print_sweep_output(cache_dir: &Path, max_idle: Duration, stats: &SweepStats) {
    for line in format_sweep_output(cache_dir, max_idle, stats) {
        println!("{}", line);
    }
}
