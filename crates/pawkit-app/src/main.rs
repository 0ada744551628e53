//! PawKit host
//!
//! Registers the pet-care app's offline worker against its origin, backed by
//! an on-disk cache, and routes requests through it the way a page would.

mod config;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use pawkit_common::{init_logging, LogFormat, PawKitError, Result};
use pawkit_net::{Request, ResourceLoader};
use pawkit_sw::{CacheStorage, DiskCacheStorage, ResponseSource, ServiceWorkerContainer};
use tracing::{error, info, warn};

use crate::config::AppConfig;

/// Command-line arguments for the `pawkit` binary.
#[derive(Debug, Parser)]
#[command(name = "pawkit", version, about = "Offline cache host for the Take Care Of My Dogs app")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, env = "PAWKIT_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Origin to register the worker for (overrides the file).
    #[arg(long, value_name = "URL")]
    origin: Option<String>,

    /// Cache directory (overrides the file).
    #[arg(long, value_name = "PATH")]
    cache_dir: Option<PathBuf>,

    /// Log format: pretty, compact or json.
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    /// More verbose logging (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install and activate the configured worker version.
    Install,
    /// Request paths through the worker and report where each answer came from.
    Fetch {
        /// Paths relative to the origin.
        #[arg(required = true)]
        paths: Vec<String>,

        /// Send `Accept: text/html`, as a page navigation does.
        #[arg(long)]
        html: bool,
    },
    /// List cache buckets and their entry counts.
    Buckets,
    /// Write the effective configuration to the config file.
    InitConfig,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run(Cli::parse()).await {
        error!(category = e.category(), error = %e, "pawkit failed");
        eprintln!("error: {e}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load(&config_path)?;
    if let Some(origin) = cli.origin {
        config.origin = origin;
    }
    if let Some(cache_dir) = cli.cache_dir {
        config.cache_dir = cache_dir;
    }

    let mut log_config = config.log_config()?.with_verbosity(cli.verbose);
    if let Some(format) = cli.log_format {
        log_config = log_config.with_format(format);
    }
    init_logging(log_config)?;

    match cli.command {
        Command::Install => install(&config).await,
        Command::Fetch { paths, html } => fetch(&config, &paths, html).await,
        Command::Buckets => buckets(&config).await,
        Command::InitConfig => {
            config.save(&config_path)?;
            println!("{}", config_path.display());
            Ok(())
        }
    }
}

async fn container(config: &AppConfig) -> Result<(ServiceWorkerContainer, Arc<DiskCacheStorage>)> {
    let storage = Arc::new(DiskCacheStorage::open_dir(&config.cache_dir).await?);
    let network = Arc::new(ResourceLoader::new(config.loader_config())?);
    let (container, _events) =
        ServiceWorkerContainer::new(config.origin_url()?, storage.clone(), network);
    Ok((container, storage))
}

async fn install(config: &AppConfig) -> Result<()> {
    let worker_config = config.worker_config()?;
    let (container, storage) = container(config).await?;

    container.register(worker_config).await?;

    let version = container
        .active_version()
        .await
        .ok_or_else(|| PawKitError::worker("no active worker after install"))?;
    let entries = storage.entry_count(&version).await.unwrap_or(0);
    info!(version = %version, entries, dir = %storage.dir().display(), "Worker active");
    println!("{version}: {entries} entries");
    Ok(())
}

async fn fetch(config: &AppConfig, paths: &[String], html: bool) -> Result<()> {
    let worker_config = config.worker_config()?;
    let origin = config.origin_url()?;
    let (container, _storage) = container(config).await?;

    if let Err(e) = container.resume(worker_config).await {
        warn!(error = %e, "Worker unavailable; continuing online-only");
    }
    let page = container.open_client(origin.clone()).await;

    for path in paths {
        let url = origin
            .join(path)
            .map_err(|e| PawKitError::InvalidArgument(format!("{path}: {e}")))?;
        let mut request = Request::get(url);
        if html {
            request = request.accept("text/html");
        }

        match container.fetch(&page.id, &request).await {
            Ok(answer) => {
                let source = match answer.source {
                    ResponseSource::Cache => "cache",
                    ResponseSource::Network => "network",
                    ResponseSource::OfflineFallback => "offline fallback",
                };
                println!(
                    "{} {} {} ({} bytes)",
                    answer.response.status.as_u16(),
                    source,
                    path,
                    answer.response.body.len()
                );
            }
            Err(e) => println!("--- failed {path}: {e}"),
        }
    }

    let flushed = container.flush().await;
    info!(flushed, "Cache writes settled");
    Ok(())
}

async fn buckets(config: &AppConfig) -> Result<()> {
    let storage = DiskCacheStorage::open_dir(&config.cache_dir).await?;
    let names = storage.keys().await;
    if names.is_empty() {
        println!("no buckets in {}", storage.dir().display());
    }
    for name in names {
        let entries = storage.entry_count(&name).await.unwrap_or(0);
        let marker = if name == config.version { "*" } else { " " };
        println!("{marker} {name} ({entries} entries)");
    }
    Ok(())
}
