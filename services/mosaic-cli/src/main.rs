//! Night-light mosaic command-line tool.
//!
//! - `get`: build (or load from cache) one mosaic and write it as GeoTIFF
//! - `dates`: list capture dates available for a region
//! - `index`: report statistics of the tile descriptor index
//! - `sync-metadata`: download and unpack the tile descriptor archive

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use orchestrator::{CacheBackend, FetchConfig, HttpTileFetcher, MosaicConfig, MosaicService, PRIMARY_VARIABLE};
use tile_index::{Resolution, TileIndex};

#[derive(Parser, Debug)]
#[command(name = "ntl-mosaic")]
#[command(about = "Assemble and cache night-time-light mosaics")]
struct Args {
    /// Root data directory (overrides DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Cache backend: filesystem, memory or redis (overrides NTL_CACHE_BACKEND)
    #[arg(long, global = true)]
    cache_backend: Option<CacheBackend>,

    /// Boundary resolution: 10m, 50m or 110m (overrides NTL_BOUNDARY_RESOLUTION)
    #[arg(long, global = true)]
    resolution: Option<Resolution>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build one mosaic and write it to disk
    Get {
        /// Region id, e.g. MMR
        #[arg(long)]
        region: String,

        /// Capture date (YYYY-MM-DD)
        #[arg(long)]
        date: NaiveDate,

        #[arg(long, default_value = PRIMARY_VARIABLE)]
        variable: String,

        /// Ignore and replace any cached mosaic
        #[arg(long)]
        no_cache: bool,

        /// Output GeoTIFF path (default: {region}_{date}.tif)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List dates with tiles covering a region
    Dates {
        #[arg(long)]
        region: String,
    },

    /// Show tile index statistics
    Index,

    /// Download the descriptor archive and unpack it into the metadata directory
    SyncMetadata {
        /// Download again even if the archive is already present
        #[arg(long)]
        force: bool,
    },
}

#[derive(Serialize)]
struct GetReport {
    region: String,
    date: NaiveDate,
    variable: String,
    output: PathBuf,
    bytes: usize,
    p02: f64,
    p98: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&args)?;

    match args.command {
        Command::Get {
            region,
            date,
            variable,
            no_cache,
            output,
        } => {
            let service = MosaicService::from_config(&config)
                .await
                .context("Failed to start mosaic service")?;

            let artifact = service
                .get_mosaic(&region, date, &variable, no_cache)
                .await
                .with_context(|| format!("Failed to build mosaic for {} on {}", region, date))?;

            let output = output.unwrap_or_else(|| PathBuf::from(format!("{}_{}.tif", region, date)));
            tokio::fs::write(&output, &artifact.raster_bytes)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!(path = %output.display(), bytes = artifact.raster_bytes.len(), "Wrote mosaic");

            print_json(&GetReport {
                region,
                date,
                variable,
                bytes: artifact.raster_bytes.len(),
                output,
                p02: artifact.p02,
                p98: artifact.p98,
            })?;
        }
        Command::Dates { region } => {
            let service = MosaicService::from_config(&config)
                .await
                .context("Failed to start mosaic service")?;
            let dates = service
                .available_dates(&region)
                .await
                .with_context(|| format!("Failed to list dates for {}", region))?;
            print_json(&dates)?;
        }
        Command::Index => {
            let dir = config.metadata_dir();
            let index = TileIndex::from_dir(&dir)
                .with_context(|| format!("Failed to index {}", dir.display()))?;
            print_json(&index.stats())?;
        }
        Command::SyncMetadata { force } => {
            config.ensure_dirs().context("Failed to create data directories")?;
            let fetcher = HttpTileFetcher::new(&config.tile_url_prefix, config.tiles_dir(), FetchConfig::default())?;
            let dir = config.metadata_dir();
            let descriptors = fetcher
                .fetch_metadata(&config.metadata_url, &dir, force)
                .await
                .with_context(|| format!("Failed to sync metadata from {}", config.metadata_url))?;
            info!(descriptors, dir = %dir.display(), "Metadata synced");
            print_json(&serde_json::json!({ "descriptors": descriptors, "dir": dir }))?;
        }
    }

    Ok(())
}

/// Environment configuration with command-line overrides applied.
fn load_config(args: &Args) -> Result<MosaicConfig> {
    let mut config = MosaicConfig::from_env().context("Invalid configuration")?;
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(backend) = args.cache_backend {
        config.cache_backend = backend;
    }
    if let Some(resolution) = args.resolution {
        config.boundary_resolution = resolution;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
