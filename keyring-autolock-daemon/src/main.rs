//! Keyring Autolock Daemon
//!
//! Watches the lock state of the keyring and locks it again after it has
//! stayed unlocked for the configured delay.

mod file_config;
mod observer;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use keyring_autolock_core::{
    compute_status, default_config_path, ensure_config_dir, get_config_dir, AutolockController,
    ConfigSource, MemoryStore, SecretStore, StatusReport,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use file_config::{DaemonFile, FileConfigSource};
use observer::LogObserver;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Parser)]
#[command(name = "keyring-autolock", version, about = "Lock the keyring again after a grace period")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the in-memory keyring declared under [demo] in the configuration file
    #[arg(long)]
    demo: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Watch the keyring and lock it automatically (default)
    Run,

    /// Check the keyring once and print the status as JSON
    Status,

    /// Write a configuration file with the default settings
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config_path, cli.demo).await,
        Commands::Status => status(&config_path, cli.demo).await,
        Commands::Init { force } => init(&config_path, force),
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = log_filter(env.as_deref(), verbose)?;

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// `RUST_LOG` when set and valid, `info` otherwise; `--verbose` adds debug
/// output for this program's crates on top.
fn log_filter(env: Option<&str>, verbose: bool) -> Result<EnvFilter> {
    let mut filter = env
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_LEVEL));
    if verbose {
        filter = filter
            .add_directive("keyring_autolock_core=debug".parse()?)
            .add_directive("keyring_autolock=debug".parse()?);
    }
    Ok(filter)
}

/// Pick the secret store backend
fn open_store(source: &FileConfigSource, demo: bool) -> Result<Arc<dyn SecretStore>> {
    if !demo {
        bail!(
            "No secret-service backend is built into this binary; pass --demo to use the \
             in-memory keyring from {:?}",
            source.path()
        );
    }

    let collections = source.demo_collections();
    info!("Using in-memory demo keyring with {} collections", collections.len());
    Ok(Arc::new(MemoryStore::with_collections(collections)))
}

async fn run(config_path: &Path, demo: bool) -> Result<()> {
    info!("Starting Keyring Autolock v{}", VERSION);

    let source = Arc::new(
        FileConfigSource::load(config_path)
            .with_context(|| format!("Failed to load configuration from {:?}", config_path))?,
    );
    let store = open_store(&source, demo)?;

    source.watch(CONFIG_POLL_INTERVAL);
    let handle = AutolockController::spawn(store, source.clone(), Arc::new(LogObserver))
        .context("Failed to start autolock controller")?;

    info!("Daemon ready. Press Ctrl+C to exit.");

    signal::ctrl_c().await?;
    info!("Received shutdown signal");

    handle.shutdown().await?;
    Ok(())
}

async fn status(config_path: &Path, demo: bool) -> Result<()> {
    let source = FileConfigSource::load(config_path)
        .with_context(|| format!("Failed to load configuration from {:?}", config_path))?;
    let store = open_store(&source, demo)?;
    let config = source.snapshot()?;

    store.reset_connection().await?;
    let collections = store.list_collections(&config.ignored_collections).await?;
    let counts = compute_status(&collections, &config.ignored_collections);
    let report = StatusReport::from_counts(counts, Utc::now());

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!("{:?} already exists; pass --force to overwrite it", config_path);
    }

    if let Some(parent) = config_path.parent() {
        if parent == get_config_dir() {
            ensure_config_dir()?;
        } else {
            std::fs::create_dir_all(parent)?;
        }
    }

    std::fs::write(config_path, DaemonFile::default().to_toml()?)?;
    info!("Wrote default configuration to {:?}", config_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_defaults_to_info() {
        let filter = log_filter(None, false).unwrap().to_string().to_lowercase();
        assert_eq!(filter, "info");
    }

    #[test]
    fn test_log_filter_honors_rust_log_level() {
        let filter = log_filter(Some("warn"), false).unwrap().to_string().to_lowercase();
        assert_eq!(filter, "warn");

        let filter = log_filter(Some("debug"), false).unwrap().to_string().to_lowercase();
        assert_eq!(filter, "debug");
    }

    #[test]
    fn test_log_filter_verbose_adds_crate_directives() {
        let filter = log_filter(Some("warn"), true).unwrap().to_string().to_lowercase();
        assert!(filter.contains("warn"));
        assert!(filter.contains("keyring_autolock_core=debug"));
        assert!(filter.contains("keyring_autolock=debug"));
    }
}
