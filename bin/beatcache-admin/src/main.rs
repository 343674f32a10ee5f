//! beatcache admin - maintenance CLI for the archive cache
//!
//! Opens the persisted registry, runs one administrative operation against
//! it and prints the outcome as JSON.

use anyhow::{Context, Result};
use beatcache_common::{Config, Fingerprint, Timestamp};
use beatcache_house::{DirDownloader, FsStore, House, Retry};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "beatcache-admin")]
#[command(about = "beatcache archive cache admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "beatcache.toml")]
    config: PathBuf,

    /// Persisted registry state file
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Directory holding the cached archives
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Disk budget in gigabytes
    #[arg(long)]
    max_disk_gb: Option<f64>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show a summary of the cache
    Stats,
    /// List cached entries, one JSON object per line
    List,
    /// Run one eviction pass
    Cleanup {
        /// Report what would be removed without touching the disk
        #[arg(long)]
        dry_run: bool,
    },
    /// Drop entries whose file is missing or is not a ZIP archive
    PurgeNonZip,
    /// Fetch one archive through the cache, using a local directory as origin
    Fetch {
        /// Beatmap set id
        id: u64,
        /// Fetch the variant without video
        #[arg(long)]
        no_video: bool,
        /// Directory the archives are copied from
        #[arg(long)]
        source_dir: PathBuf,
        /// Source version (RFC 3339); defaults to now
        #[arg(long, value_parser = parse_timestamp)]
        source_version: Option<Timestamp>,
    },
}

#[derive(Debug, Serialize)]
struct Summary {
    state_file: PathBuf,
    entries: usize,
    downloaded: usize,
    unavailable: usize,
    total_size: u64,
    max_size: u64,
}

fn parse_timestamp(raw: &str) -> std::result::Result<Timestamp, String> {
    chrono::DateTime::parse_from_rfc3339(raw).map_err(|e| format!("invalid timestamp {raw:?}: {e}"))
}

/// Apply command line overrides on top of the configuration file
fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(state_file) = &args.state_file {
        config.house.state_file.clone_from(state_file);
    }
    if let Some(data_dir) = &args.data_dir {
        config.storage.data_dir.clone_from(data_dir);
    }
    if let Some(max_disk_gb) = args.max_disk_gb {
        config.house.max_disk_gb = max_disk_gb;
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn summary(house: &House) -> Summary {
    let entries = house.entries();
    Summary {
        state_file: house.state_path().to_path_buf(),
        entries: entries.len(),
        downloaded: entries.iter().filter(|e| e.is_downloaded).count(),
        unavailable: entries
            .iter()
            .filter(|e| e.is_downloaded && e.file_size == 0)
            .count(),
        total_size: house.total_size(),
        max_size: house.max_size(),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let store = Arc::new(FsStore::new(config.storage.data_dir.clone()));
    let house = Arc::new(House::from_config(&config.house, store));
    let loaded = house
        .load_state()
        .with_context(|| format!("loading state from {}", house.state_path().display()))?;
    info!(entries = loaded, data_dir = %config.storage.data_dir.display(), "cache opened");

    match args.command {
        Commands::Stats => print_json(&summary(&house))?,
        Commands::List => {
            for entry in house.entries() {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Commands::Cleanup { dry_run } => {
            if dry_run {
                house.enable_dry_run();
            }
            print_json(&house.run_cleanup()?)?;
        }
        Commands::PurgeNonZip => print_json(&house.purge_non_archives()?)?,
        Commands::Fetch {
            id,
            no_video,
            source_dir,
            source_version,
        } => {
            let fingerprint = Fingerprint::new(id, no_video);
            let source_version = source_version.unwrap_or_else(beatcache_common::now);
            let downloader = Retry::new(DirDownloader::new(source_dir));

            let mut cleaner = house.start_cleaner()?;
            let entry = beatcache_house::fetch(&house, &downloader, fingerprint, source_version)?;
            cleaner.shutdown();

            // Persist the outcome before exiting
            house.run_cleanup()?;
            print_json(&entry.snapshot())?;
        }
    }

    Ok(())
}
