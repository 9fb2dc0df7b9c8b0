//! Workload identity renewer.
//!
//! Runs the identity hook for one allocation against the local development
//! signer, writing tokens into per-task secrets directories until interrupted.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use widr_common::{Allocation, RenewerConfig};
use widrd::{
    DevSigner, IdentityHook, PrerunHook, SecretDirSink, SharedTokenStore, ShutdownHook,
};

#[derive(Parser)]
#[command(name = "widrd")]
#[command(author, version, about = "Workload identity renewer")]
struct Cli {
    /// Path to the allocation description (TOML)
    #[arg(short, long)]
    alloc: PathBuf,

    /// Path to renewer configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root directory for per-task secrets
    #[arg(long)]
    secrets_root: Option<PathBuf>,

    /// Minimum wait between renewals (e.g. "10s")
    #[arg(long, value_parser = humantime::parse_duration)]
    min_wait: Option<Duration>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn load_allocation(path: &Path) -> Result<Allocation> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read allocation {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse allocation {}", path.display()))
}

fn init_logging(config: &RenewerConfig, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new(&config.log_level.value)
    };

    if config.log_json.value {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = RenewerConfig::load(cli.config.as_deref())?;
    config.apply_overrides(cli.secrets_root, cli.min_wait, cli.json_logs);
    config.validate()?;

    init_logging(&config, cli.verbose);
    info!("Starting workload identity renewer...");
    config.log_summary();

    let alloc = Arc::new(load_allocation(&cli.alloc)?);
    info!(
        alloc_id = %alloc.id,
        tasks = alloc.tasks.len(),
        "Loaded allocation"
    );

    let signer = Arc::new(DevSigner::new(&alloc));
    let store = Arc::new(SharedTokenStore::new(alloc.id.clone()));
    let mut hook = IdentityHook::new(alloc.clone(), signer, store.clone())
        .with_timing(config.timing());

    for task in alloc.tasks_with_identities() {
        let dir = config
            .secrets_root
            .value
            .join(alloc.id.as_str())
            .join(&task.name)
            .join("secrets");
        info!(task = %task.name, dir = %dir.display(), "Writing task identities");
        hook = hook.with_task_sink(task.name.clone(), Arc::new(SecretDirSink::new(dir)));
    }

    let mut updates = store.subscribe();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => info!(
                    task = %update.task,
                    identity = %update.identity,
                    kind = ?update.kind,
                    "Workload identity updated"
                ),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Token update listener lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    hook.prerun().await?;
    info!(state = %hook.state(), "Identity hook started; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutting down...");
    hook.shutdown();
    if !hook.wait_stopped(config.stop_timeout.value).await {
        warn!(timeout = ?config.stop_timeout.value, "Renewal loop aborted");
    }
    Ok(())
}
