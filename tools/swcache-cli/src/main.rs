//! Command-line driver for the swcache engine.
//!
//! Stores live on disk, so one invocation can install and a later one can
//! serve from what was installed.
//!
//! ## Usage
//!
//! ```bash
//! # Precache the manifest for the configured version
//! swcache --config swcache.json install
//!
//! # Remove stores left behind by older versions
//! swcache --config swcache.json activate
//!
//! # Route a request through the engine
//! swcache fetch http://localhost:8080/schedule --navigate
//!
//! # Show a notification for a push payload
//! swcache push '{"title":"Update","body":"New schedule posted"}'
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use http::{header, HeaderValue};
use swcache_common::{init_logging, LogConfig, LogFormat, RetryConfig};
use swcache_engine::{DiskBackend, Engine, EngineBuilder, EngineConfig, FetchOutcome, Request};
use tracing::{info, warn};
use url::Url;

mod sink;

use sink::StdoutSink;

#[derive(Parser)]
#[command(name = "swcache")]
#[command(about = "Offline caching engine driver", version)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the stores
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,

    /// More log output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Precache the manifest into the current store
    Install {
        /// Attempts before giving up
        #[arg(long, default_value = "3")]
        attempts: u32,
    },

    /// Delete stale stores of older versions
    Activate,

    /// Route one request through the engine
    Fetch {
        /// Absolute request URL
        url: Url,
        /// Send as a navigation request
        #[arg(long)]
        navigate: bool,
        /// Value of the accept header
        #[arg(long)]
        accept: Option<String>,
    },

    /// Handle a push, printing the notification shown
    Push {
        /// Raw payload; omit for a push without data
        payload: Option<String>,
    },

    /// List stores and their entry counts
    Stores,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_verbosity(cli.verbose);
    if cli.json_logs {
        log_config = log_config.with_format(LogFormat::Json);
    }
    init_logging(log_config);

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let store_dir = cli.store_dir.clone().unwrap_or_else(DiskBackend::default_root);
    info!(store_dir = %store_dir.display(), "Using store directory");

    let (engine, _events) = EngineBuilder::new()
        .config(config)
        .backend(Arc::new(DiskBackend::new(&store_dir)))
        .notification_sink(Arc::new(StdoutSink::new()))
        .build()
        .context("failed to build engine")?;

    match cli.command {
        Commands::Install { attempts } => install(&engine, attempts).await,
        Commands::Activate => activate(&engine).await,
        Commands::Fetch {
            url,
            navigate,
            accept,
        } => fetch(&engine, url, navigate, accept).await,
        Commands::Push { payload } => {
            let shown = engine.push(payload.as_deref().map(str::as_bytes)).await?;
            if shown.is_none() {
                println!("no payload, nothing shown");
            }
            Ok(())
        }
        Commands::Stores => stores(&engine).await,
    }
}

async fn install(engine: &Engine, attempts: u32) -> Result<()> {
    let retry = RetryConfig {
        max_attempts: attempts,
        ..Default::default()
    };
    let report = engine
        .install_with_retry(&retry)
        .await
        .with_context(|| format!("install of {} failed", engine.version()))?;
    println!("installed {} ({} entries)", report.store, report.precached);
    Ok(())
}

async fn activate(engine: &Engine) -> Result<()> {
    engine
        .resume()
        .await
        .with_context(|| format!("{} is not installed; run install first", engine.version()))?;
    let report = engine.activate().await?;

    for tag in &report.deleted {
        println!("deleted {tag}");
    }
    for failure in &report.failures {
        println!("failed: {failure}");
    }
    println!("active: {}", report.current);
    Ok(())
}

async fn fetch(engine: &Engine, url: Url, navigate: bool, accept: Option<String>) -> Result<()> {
    if let Err(e) = engine.resume().await {
        warn!(error = %e, "Engine not installed, requests pass through");
    }

    let mut request = if navigate {
        Request::navigate(url)
    } else {
        Request::get(url)
    };
    if let Some(accept) = accept {
        let value = HeaderValue::from_str(&accept).context("invalid accept header")?;
        request = request.header(header::ACCEPT, value);
    }

    match engine.fetch(&request).await? {
        FetchOutcome::PassThrough => println!("pass-through {}", request.url),
        FetchOutcome::Respond(response) => {
            println!("{} {:?} {}", response.status, response.source, response.url);
            println!("{}", String::from_utf8_lossy(response.body()));
        }
    }

    let settled = engine.settle_writes().await;
    info!(settled, "Write-throughs settled");
    Ok(())
}

async fn stores(engine: &Engine) -> Result<()> {
    let current = engine.version().name();
    let storage = engine.storage();
    for tag in storage.list_versions("").await? {
        let entries = storage.cache(&tag).keys().await?.len();
        let marker = if tag == current { "*" } else { " " };
        println!("{marker} {tag} ({entries} entries)");
    }
    Ok(())
}
