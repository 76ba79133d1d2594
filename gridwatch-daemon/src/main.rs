//! `gridwatchd`: watches spreadsheet directories and appends classified cell
//! changes to a compressed change log.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gridwatch_config::{ConfigSource, GridwatchConfig};
use gridwatch_core::{
    BaselineStore, CsvChangeLog, DiffEngine, JsonlOpsLog, Pipeline, StableCopy, WatchService,
    XlsxDecoder,
};

#[derive(Debug, Parser)]
#[command(name = "gridwatchd", version, about)]
struct Cli {
    /// Configuration file (TOML or JSON). Overrides the
    /// GRIDWATCH_CONFIG_PATH / GRIDWATCH_CONFIG_JSON lookup.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Additional directories to watch, on top of any configured roots.
    #[arg(short, long = "root")]
    roots: Vec<PathBuf>,

    /// Validate the configuration and exit without watching anything.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gridwatch=info,gridwatchd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let (mut config, source) = match &cli.config {
        Some(path) => (
            GridwatchConfig::load_from_file(path)?,
            ConfigSource::Cli(path.clone()),
        ),
        None => GridwatchConfig::load_from_env()?,
    };
    config.watch_roots.extend(cli.roots.iter().cloned());
    config.validate().context("invalid configuration")?;
    info!(?source, roots = config.watch_roots.len(), "configuration loaded");

    if cli.check {
        println!("configuration ok ({} watch roots)", config.watch_roots.len());
        return Ok(());
    }

    for dir in [config.cache_dir(), config.baseline_dir(), config.log_dir()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create data directory {}", dir.display()))?;
    }

    let ops_log = Arc::new(JsonlOpsLog::new(config.log_dir()));
    let change_log = Arc::new(CsvChangeLog::new(config.log_dir()));
    let copier = Arc::new(StableCopy::new(
        config.copy.clone(),
        config.cache_dir(),
        ops_log,
    ));
    let pipeline = Arc::new(Pipeline::new(
        config.copy.clone(),
        copier,
        Arc::new(XlsxDecoder),
        DiffEngine::new(config.policy.clone()),
        BaselineStore::new(config.baseline_dir(), config.baseline_compression),
        change_log,
    ));

    let service = WatchService::new(
        config.watcher.clone(),
        pipeline,
        config.extensions.clone(),
    )?;
    service.start().await?;
    for root in &config.watch_roots {
        // One unreachable share should not keep the rest from being watched.
        if let Err(err) = service.watch_root(root).await {
            warn!(root = %root.display(), "skipping watch root: {err}");
        }
    }
    if service.watched_targets().await.is_empty() {
        info!("no spreadsheet files found yet; waiting for them to appear");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested, draining in-flight work");
    service.shutdown().await;
    Ok(())
}
