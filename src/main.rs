use clap::{Parser, Subcommand};
use dajtu::cache::SizeCache;
use dajtu::config::{self, DajtuConfig, Overrides};
use dajtu::coordinator::ResizeCoordinator;
use dajtu::imaging::{CropRect, RustBackend, Transform};
use dajtu::ingest::{Ingester, UploadReport};
use dajtu::resolver::Resolver;
use dajtu::slug::Slug;
use dajtu::store::OriginStore;
use dajtu::{output, server};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn version_string() -> &'static str {
    let on_tag = env!("ON_RELEASE_TAG");
    if on_tag == "true" {
        env!("CARGO_PKG_VERSION")
    } else {
        let hash = env!("GIT_HASH");
        if hash.is_empty() {
            "dev@unknown"
        } else {
            // Leaked once at startup
            Box::leak(format!("dev@{hash}").into_boxed_str())
        }
    }
}

#[derive(Parser)]
#[command(name = "dajtu")]
#[command(about = "Image host with on-demand resizing")]
#[command(long_about = "\
Image host with on-demand resizing

Uploads are stored as WebP under short slugs with a fixed set of precomputed
variants. Other widths are resized on first request and cached on disk.

URLs served by 'dajtu serve':

  /i/{slug}.webp             original
  /i/{slug}/max.webp         original
  /i/{slug}/{preset}.webp    precomputed variant (e.g. thumb, 200, 1920)
  /i/{slug}/{width}.webp     on-demand width (e.g. 800, 1200, 1600, 2400)
  /health                    status and cache counters

Run 'dajtu gen-config' to generate a documented dajtu.toml.")]
#[command(version = version_string())]
struct Cli {
    /// Config file (default: ./dajtu.toml if present)
    #[arg(long, env = "DAJTU_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Data directory holding the origin store
    #[arg(long, env = "DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Size cache directory
    #[arg(long, env = "CACHE_DIR", global = true)]
    cache_dir: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "DAJTU_LISTEN", global = true)]
    listen: Option<String>,

    #[command(subcommand)]
    command: Command,
}

/// Geometric edits applied before rendering presets.
#[derive(clap::Args, Clone)]
struct TransformArgs {
    /// Clockwise rotation in degrees (multiples of 90)
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    rotate: i32,
    /// Mirror horizontally
    #[arg(long)]
    flip_h: bool,
    /// Mirror vertically
    #[arg(long)]
    flip_v: bool,
    /// Crop rectangle after rotation, as X,Y,W,H
    #[arg(long, value_parser = parse_crop)]
    crop: Option<CropRect>,
}

impl From<TransformArgs> for Transform {
    fn from(args: TransformArgs) -> Self {
        Transform {
            rotation: args.rotate,
            flip_h: args.flip_h,
            flip_v: args.flip_v,
            crop: args.crop,
        }
    }
}

fn parse_crop(s: &str) -> Result<CropRect, String> {
    let parts: Vec<u32> = s
        .split(',')
        .map(|p| p.trim().parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid crop {s:?}: {e}"))?;
    match parts.as_slice() {
        &[x, y, width, height] => Ok(CropRect {
            x,
            y,
            width,
            height,
        }),
        _ => Err(format!("crop must be X,Y,W,H, got {s:?}")),
    }
}

#[derive(Subcommand)]
enum Command {
    /// Serve images over HTTP
    Serve,
    /// Store a new image and print its URLs
    Ingest {
        file: PathBuf,
        #[command(flatten)]
        transform: TransformArgs,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Re-render a stored image with a transform (keeps a backup of the first version)
    Edit {
        slug: Slug,
        #[command(flatten)]
        transform: TransformArgs,
        #[arg(long)]
        json: bool,
    },
    /// Undo all edits of a stored image
    Restore {
        slug: Slug,
        #[arg(long)]
        json: bool,
    },
    /// Delete cache files not served recently
    Sweep {
        /// Override cache.max_idle_hours
        #[arg(long)]
        max_idle_hours: Option<u64>,
    },
    /// Print a stock dajtu.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing();

    let overrides = Overrides {
        data_dir: cli.data_dir,
        cache_dir: cli.cache_dir,
        listen: cli.listen,
    };
    match cli.command {
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
        command => {
            let cfg = config::load_config(cli.config.as_deref())?.with_overrides(&overrides);
            init_thread_pool(&cfg.processing);
            run(command, cfg)?;
        }
    }

    Ok(())
}

fn run(command: Command, cfg: DajtuConfig) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Serve => serve(cfg)?,
        Command::Ingest {
            file,
            transform,
            json,
        } => {
            let data = std::fs::read(&file)?;
            let report = ingester(&cfg).ingest(&data, transform.into())?;
            print_report(&report, json)?;
        }
        Command::Edit {
            slug,
            transform,
            json,
        } => {
            let report = ingester(&cfg).edit(&slug, transform.into())?;
            print_report(&report, json)?;
        }
        Command::Restore { slug, json } => {
            let report = ingester(&cfg).restore(&slug)?;
            print_report(&report, json)?;
        }
        Command::Sweep { max_idle_hours } => {
            let max_idle = max_idle_hours
                .map(|h| Duration::from_secs(h.saturating_mul(3600)))
                .unwrap_or_else(|| cfg.cache.max_idle());
            let cache = SizeCache::new(&cfg.storage.cache_dir);
            let stats = cache.sweep(max_idle);
            output::print_sweep_output(cache.root(), max_idle, &stats);
        }
        Command::GenConfig => print!("{}", config::stock_config_toml()),
    }
    Ok(())
}

fn serve(cfg: DajtuConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = OriginStore::new(&cfg.storage.data_dir);
    let cache = SizeCache::new(&cfg.storage.cache_dir);
    std::fs::create_dir_all(store.root())?;
    std::fs::create_dir_all(cache.root())?;

    if let Some(interval) = cfg.cache.sweep_interval() {
        spawn_janitor(cache.clone(), interval, cfg.cache.max_idle());
    }

    let coordinator =
        ResizeCoordinator::new(store, cache, RustBackend::new(), cfg.images.quality());
    let resolver = Resolver::new(coordinator, &cfg.images.dynamic_widths, &cfg.images.presets);
    let app = server::router(Arc::new(resolver));

    tracing::info!(
        data_dir = %cfg.storage.data_dir.display(),
        cache_dir = %cfg.storage.cache_dir.display(),
        widths = ?cfg.images.dynamic_widths,
        "starting"
    );
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(server::serve(&cfg.server.listen, app))?;
    Ok(())
}

/// Periodic cache sweep on a plain thread; it only does blocking file I/O.
fn spawn_janitor(cache: SizeCache, interval: Duration, max_idle: Duration) {
    std::thread::spawn(move || {
        loop {
            std::thread::sleep(interval);
            let stats = cache.sweep(max_idle);
            tracing::info!(
                removed = stats.removed,
                temp_removed = stats.temp_removed,
                bytes_freed = stats.bytes_freed,
                scanned = stats.scanned,
                errors = stats.errors,
                "cache sweep"
            );
        }
    });
}

fn ingester(cfg: &DajtuConfig) -> Ingester<RustBackend> {
    Ingester::new(
        OriginStore::new(&cfg.storage.data_dir),
        RustBackend::new(),
        cfg.images.presets.clone(),
        cfg.images.max_file_size_bytes(),
    )
    .with_base_url(&cfg.server.base_url)
}

fn print_report(report: &UploadReport, json: bool) -> Result<(), serde_json::Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        output::print_upload_report(report);
    }
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Initialize the rayon thread pool based on processing config.
///
/// Capped at the number of available CPU cores.
fn init_thread_pool(processing: &config::ProcessingConfig) {
    let threads = config::effective_threads(processing);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}
