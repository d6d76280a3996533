//! Service configuration.
//!
//! Loaded from a TOML file (default `dajtu.toml` in the working directory),
//! merged over stock defaults, then overridden by command-line flags and
//! environment variables. Every key is optional.
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! base_url = ""               # prefix for URLs printed by `ingest`
//!
//! [storage]
//! data_dir = "./data"         # origin store lives in {data_dir}/images
//! cache_dir = "/tmp/dajtu-cache"
//!
//! [images]
//! quality = 90                # WebP quality for on-demand widths (1-100)
//! dynamic_widths = [800, 1200, 1600, 2400]
//! max_file_size_mb = 20
//!
//! [[images.presets]]          # precomputed at upload; replaces the whole list
//! name = "original"
//! width = 4096
//!
//! [cache]
//! max_idle_hours = 72         # janitor deletes cache files idle this long
//! sweep_interval_minutes = 60 # 0 disables the janitor thread in `serve`
//!
//! [processing]
//! max_processes = 4           # omit for auto = CPU cores
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::imaging::{ORIGINAL, Preset, Quality, default_presets};
use crate::resolver::MAX_ALIAS;
use crate::store::BACKUP_VARIANT;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "dajtu.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DajtuConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub images: ImagesConfig,
    pub cache: CacheConfig,
    pub processing: ProcessingConfig,
}

impl DajtuConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.images.quality) {
            return Err(ConfigError::Validation(
                "images.quality must be 1-100".into(),
            ));
        }
        if self.images.dynamic_widths.contains(&0) {
            return Err(ConfigError::Validation(
                "images.dynamic_widths must be positive".into(),
            ));
        }
        if self.images.max_file_size_mb == 0 {
            return Err(ConfigError::Validation(
                "images.max_file_size_mb must be positive".into(),
            ));
        }
        if !self.images.presets.iter().any(|p| p.name == ORIGINAL) {
            return Err(ConfigError::Validation(format!(
                "images.presets must include \"{ORIGINAL}\""
            )));
        }
        let mut seen = HashSet::new();
        for preset in &self.images.presets {
            if preset.width == 0 || preset.height == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "preset \"{}\" must have positive dimensions",
                    preset.name
                )));
            }
            if !valid_preset_name(&preset.name) {
                return Err(ConfigError::Validation(format!(
                    "preset name \"{}\" must be lowercase alphanumeric",
                    preset.name
                )));
            }
            if [BACKUP_VARIANT, MAX_ALIAS].contains(&preset.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "preset name \"{}\" is reserved",
                    preset.name
                )));
            }
            if !seen.insert(preset.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate preset \"{}\"",
                    preset.name
                )));
            }
        }
        if self.cache.max_idle_hours == 0 {
            return Err(ConfigError::Validation(
                "cache.max_idle_hours must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Apply command-line / environment overrides.
    pub fn with_overrides(mut self, overrides: &Overrides) -> Self {
        if let Some(dir) = &overrides.data_dir {
            self.storage.data_dir = dir.clone();
        }
        if let Some(dir) = &overrides.cache_dir {
            self.storage.cache_dir = dir.clone();
        }
        if let Some(listen) = &overrides.listen {
            self.server.listen = listen.clone();
        }
        self
    }
}

/// Preset names become file names and URL segments.
fn valid_preset_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Values from flags and environment that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub data_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: String,
    /// Prefix for image URLs in ingest reports. Empty means relative URLs.
    pub base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            base_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache_dir: PathBuf::from("/tmp/dajtu-cache"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImagesConfig {
    /// WebP quality for on-demand widths.
    pub quality: u32,
    /// Widths served on demand through the size cache.
    pub dynamic_widths: Vec<u32>,
    /// Upload size limit.
    pub max_file_size_mb: u64,
    /// Variants rendered once at upload.
    pub presets: Vec<Preset>,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            quality: 90,
            dynamic_widths: vec![800, 1200, 1600, 2400],
            max_file_size_mb: 20,
            presets: default_presets(),
        }
    }
}

impl ImagesConfig {
    pub fn quality(&self) -> Quality {
        Quality::new(self.quality)
    }

    pub fn max_file_size_bytes(&self) -> usize {
        (self.max_file_size_mb as usize).saturating_mul(1024 * 1024)
    }
}

/// Cache janitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub max_idle_hours: u64,
    pub sweep_interval_minutes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_idle_hours: 72,
            sweep_interval_minutes: 60,
        }
    }
}

impl CacheConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_hours.saturating_mul(3600))
    }

    /// `None` when the periodic sweep is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_minutes > 0)
            .then(|| Duration::from_secs(self.sweep_interval_minutes.saturating_mul(60)))
    }
}

/// Parallel processing settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of parallel encode workers (upload presets and
    /// blocking request workers). When absent, the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_processes: Option<usize>,
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config
        .max_processes
        .map(|n| n.clamp(1, cores))
        .unwrap_or(cores)
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
///
/// Base layer for merging user overrides on top.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(DajtuConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely, so a user
///   `[[images.presets]]` list replaces the stock list.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Read a config file as a raw TOML value.
pub fn load_raw_config(path: &Path) -> Result<toml::Value, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<DajtuConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: DajtuConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load the effective config.
///
/// An explicit `path` must exist. Without one, [`DEFAULT_CONFIG_FILE`] is used
/// if present and stock defaults otherwise.
pub fn load_config(path: Option<&Path>) -> Result<DajtuConfig, ConfigError> {
    let overlay = match path {
        Some(p) => Some(load_raw_config(p)?),
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            if default.is_file() {
                Some(load_raw_config(default)?)
            } else {
                None
            }
        }
    };
    resolve_config(stock_defaults_value()?, overlay)
}

/// Returns a fully-commented stock `dajtu.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# dajtu configuration
# ===================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
#
# Command-line flags and environment variables override this file:
#   --data-dir  / DATA_DIR
#   --cache-dir / CACHE_DIR
#   --listen    / DAJTU_LISTEN
#
# Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# HTTP server
# ---------------------------------------------------------------------------
[server]
# Address the image server binds to.
listen = "0.0.0.0:8080"

# Prefix for image URLs printed by `dajtu ingest`. Empty = relative URLs.
base_url = ""

# ---------------------------------------------------------------------------
# Storage
# ---------------------------------------------------------------------------
[storage]
# Origin store root. Images live in {data_dir}/images/{ab}/{slug}/.
data_dir = "./data"

# On-demand size cache. Safe to delete at any time.
cache_dir = "/tmp/dajtu-cache"

# ---------------------------------------------------------------------------
# Images
# ---------------------------------------------------------------------------
[images]
# WebP quality for on-demand widths (1 = worst, 100 = best).
quality = 90

# Widths served on demand via /i/{slug}/{width}.webp and cached.
# A width listed here shadows a preset with the same name.
dynamic_widths = [800, 1200, 1600, 2400]

# Uploads larger than this are rejected.
max_file_size_mb = 20

# Variants rendered once at upload and stored permanently.
# Listing any preset replaces the whole list; "original" is required.
# width is a maximum (never upscaled); width + height is a centre crop.
[[images.presets]]
name = "original"
width = 4096
quality = 90

[[images.presets]]
name = "1920"
width = 1920
quality = 90

[[images.presets]]
name = "200"
width = 200
quality = 90

[[images.presets]]
name = "thumb"
width = 150
height = 150
quality = 85

# ---------------------------------------------------------------------------
# Cache janitor
# ---------------------------------------------------------------------------
[cache]
# Cache files not served for this long are deleted.
max_idle_hours = 72

# How often `dajtu serve` runs the janitor. 0 disables it.
sweep_interval_minutes = 60

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Maximum parallel encode workers. Omit to use all CPU cores.
# Values above the core count are clamped down.
# max_processes = 4
"##
}
