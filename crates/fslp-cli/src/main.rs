use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use fslp_core::{County, ScrapeSource, SourceType};
use fslp_import::{ImportConfig, Importer};
use fslp_jobs::{Scheduler, SchedulerConfig, Worker, WorkerConfig};
use fslp_store::{FetchConfig, PageFetcher, RecordStore, RestStore, StoreConfig};

#[derive(Debug, Parser)]
#[command(name = "fslp-cli")]
#[command(about = "FSLP command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Promote validated staging leads into production.
    Import {
        /// Validate and log without writing anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the long-lived scrape job worker.
    Worker,
    /// Run the long-lived job scheduler.
    Scheduler,
    /// Load counties and scrape sources from a YAML file.
    Seed {
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store_config = StoreConfig::from_env();

    match cli.command {
        Commands::Import { dry_run } => run_import(&store_config, dry_run).await,
        Commands::Worker => run_worker(&store_config).await,
        Commands::Scheduler => run_scheduler(&store_config).await,
        Commands::Seed { file } => run_seed(&store_config, &file).await,
    }
}

async fn run_import(store_config: &StoreConfig, dry_run: bool) -> Result<()> {
    let store = Arc::new(RestStore::new(store_config)?);
    let importer = Importer::new(store, ImportConfig::default(), dry_run);

    let stats = tokio::select! {
        stats = importer.run() => stats?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("import interrupted");
            std::process::exit(130);
        }
    };

    println!(
        "import complete: processed={} validated={} imported={} duplicates={} rejected={} low_quality={} errors={}",
        stats.total_processed,
        stats.validated,
        stats.imported,
        stats.skipped_duplicate,
        stats.rejected_validation,
        stats.rejected_quality,
        stats.errors,
    );

    if stats.errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_worker(store_config: &StoreConfig) -> Result<()> {
    let store: Arc<dyn RecordStore> = Arc::new(RestStore::new(store_config)?);
    let http = Arc::new(PageFetcher::new(FetchConfig::default())?);
    let worker = Worker::new(store, http, WorkerConfig::from_env());
    worker.run(shutdown_signal()).await
}

async fn run_scheduler(store_config: &StoreConfig) -> Result<()> {
    let store: Arc<dyn RecordStore> = Arc::new(RestStore::new(store_config)?);
    let scheduler = Scheduler::new(store, SchedulerConfig::from_env());
    scheduler.run(shutdown_signal()).await
}

/// Flips to true on SIGINT/SIGTERM so long-lived loops stop between
/// discrete operations.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("installing SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        let _ = tx.send(true);
    });
    rx
}

#[derive(Debug, Deserialize)]
struct SeedFile {
    #[serde(default)]
    counties: Vec<SeedCounty>,
    #[serde(default)]
    sources: Vec<SeedSource>,
}

#[derive(Debug, Deserialize)]
struct SeedCounty {
    name: String,
    state_abbr: String,
    #[serde(default = "default_true")]
    has_online_records: bool,
    #[serde(default = "default_frequency_hours")]
    scrape_frequency_hours: i64,
}

#[derive(Debug, Deserialize)]
struct SeedSource {
    name: String,
    #[serde(default)]
    scraper_name: Option<String>,
    #[serde(default)]
    source_type: Option<SourceType>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    states: Vec<String>,
    #[serde(default = "default_rate_limit")]
    rate_limit: u32,
}

fn default_true() -> bool {
    true
}

fn default_frequency_hours() -> i64 {
    24
}

fn default_rate_limit() -> u32 {
    10
}

fn load_seed_file(path: &Path) -> Result<SeedFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn run_seed(store_config: &StoreConfig, path: &Path) -> Result<()> {
    let seed = load_seed_file(path)?;
    let store = RestStore::new(store_config)?;

    let counties: Vec<County> = seed
        .counties
        .into_iter()
        .map(|county| County {
            id: Uuid::new_v4(),
            name: county.name,
            state_abbr: county.state_abbr,
            is_active: true,
            has_online_records: county.has_online_records,
            consecutive_failures: 0,
            scrape_frequency_hours: county.scrape_frequency_hours,
            next_scheduled_scrape: None,
            last_scraped_at: None,
            last_successful_scrape: None,
            total_leads_found: 0,
        })
        .collect();

    let sources: Vec<ScrapeSource> = seed
        .sources
        .into_iter()
        .map(|source| ScrapeSource {
            id: Uuid::new_v4(),
            name: source.name,
            scraper_name: source.scraper_name,
            source_type: source.source_type,
            base_url: source.base_url,
            states_covered: source.states,
            is_active: true,
            rate_limit: source.rate_limit,
        })
        .collect();

    if counties.is_empty() && sources.is_empty() {
        warn!("seed file contains no counties or sources");
        return Ok(());
    }

    if !counties.is_empty() {
        store.insert_counties(&counties).await?;
    }
    if !sources.is_empty() {
        store.insert_sources(&sources).await?;
    }

    println!(
        "seeded {} counties and {} sources",
        counties.len(),
        sources.len()
    );
    Ok(())
}
