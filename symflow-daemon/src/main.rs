//! # symflow
//!
//! Daemon keeping a symbolic-link tree in sync with a (typically
//! cloud-mounted) media directory and telling an Emby-compatible media
//! server about the results.
//!
//! Wiring: three change sources (filesystem watcher, periodic scanner,
//! remote change-feed poller) feed a reconciler backed by an embedded
//! SQLite path index; new or modified files become prioritized
//! materialization tasks; created links are batched into per-library
//! media server refreshes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use symflow_config::{Config, ConfigSource, apply_guard_rails};
use symflow_core::{
    FileIndex, HttpChangeFeed, HttpMediaServer, LinkMaterializer, LinkTaskRunner, NotifierConfig,
    PipelineConfig, Reconciler, RefreshBatcher, RemoteSource, ScanSource, SourceHealth,
    SqliteFileIndex, StatusReport, TaskPipeline, WatchSource,
};

/// How long each background task gets to wind down at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
/// Cadence of the periodic status report in the log.
const STATUS_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(name = "symflow", version)]
#[command(about = "Media symlink synchronization daemon")]
struct Cli {
    /// Configuration file (TOML or JSON). Skips the default discovery order.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (config, source) = match &cli.config {
        Some(path) => {
            let config = Config::load_from_file(path).context("failed to load configuration")?;
            (config, ConfigSource::File(path.clone()))
        }
        None => Config::load_from_env().context("failed to load configuration")?,
    };
    apply_guard_rails(&config).context("configuration rejected")?;

    match &source {
        ConfigSource::Default => warn!("No configuration file found, running on defaults"),
        ConfigSource::EnvPath(path) | ConfigSource::File(path) => {
            info!("Configuration loaded from {}", path.display())
        }
        ConfigSource::EnvInline => info!("Configuration loaded from SYMFLOW_CONFIG_JSON"),
    }

    if cli.check {
        info!("Configuration OK");
        return Ok(());
    }

    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(
        monitored_root = %config.paths.monitored_root.display(),
        link_base = %config.paths.link_base.display(),
        "Starting symflow"
    );

    let index = Arc::new(
        SqliteFileIndex::open(&config.index.path)
            .await
            .context("failed to open the path index")?,
    );
    if config.index.compact_threshold_bytes > 0 {
        index
            .compact_if_oversized(config.index.compact_threshold_bytes)
            .await
            .context("startup compaction failed")?;
    }

    let batcher = if config.notifier.base_url.trim().is_empty() {
        warn!("No media server configured, library refreshes disabled");
        None
    } else {
        let client = HttpMediaServer::new(
            config.notifier.base_url.clone(),
            config.notifier.api_token.clone(),
            Duration::from_secs(config.notifier.timeout_secs),
        )
        .context("failed to build the media server client")?;
        Some(Arc::new(RefreshBatcher::new(
            Arc::new(client),
            NotifierConfig {
                retry_count: config.notifier.retry_count,
                retry_delay: Duration::from_secs(config.notifier.retry_delay_secs),
            },
        )))
    };

    let materializer = LinkMaterializer::new(
        config.paths.monitored_root.clone(),
        config.paths.link_base.clone(),
        config.materialize.media_extensions.clone(),
        config.materialize.ignored_segments.clone(),
        config.materialize.overwrite,
    );
    let runner = Arc::new(LinkTaskRunner::new(materializer, batcher.clone()));

    let pipeline = TaskPipeline::new(
        PipelineConfig {
            workers: config.pipeline.workers,
            max_retries: config.pipeline.max_retries,
            retry_delay: Duration::from_secs(config.pipeline.retry_delay_secs),
            retention: Duration::from_secs(config.pipeline.retention_secs),
            sweep_interval: Duration::from_secs(config.pipeline.sweep_interval_secs),
        },
        runner,
    );
    pipeline.start().await;

    let reconciler = Arc::new(Reconciler::new(index.clone(), pipeline.clone()));
    let health = SourceHealth::new();
    let cancel = CancellationToken::new();
    let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    let watch = WatchSource::new(
        config.paths.monitored_root.clone(),
        config.materialize.ignored_segments.clone(),
        reconciler.clone(),
        health.clone(),
    );
    {
        let token = cancel.child_token();
        handles.push((
            "watch source",
            tokio::spawn(async move {
                if let Err(e) = watch.run(token).await {
                    error!("Watch source failed: {}", e);
                }
            }),
        ));
    }

    let scan = ScanSource::new(
        config.paths.monitored_root.clone(),
        Duration::from_secs(config.scan.interval_secs),
        Duration::from_secs(config.scan.cache_max_age_secs),
        config.materialize.ignored_segments.clone(),
        reconciler.clone(),
        index.clone(),
        health.clone(),
    );
    {
        let token = cancel.child_token();
        handles.push(("scan source", tokio::spawn(scan.run(token))));
    }

    if config.remote.enabled {
        let feed = HttpChangeFeed::new(
            config.remote.base_url.clone(),
            config.remote.api_token.clone(),
            Duration::from_secs(config.remote.timeout_secs),
        )
        .context("failed to build the remote change feed client")?;
        let remote = RemoteSource::new(
            Arc::new(feed),
            reconciler.clone(),
            health.clone(),
            config.remote.root_item_id.clone(),
            config.paths.monitored_root.clone(),
            Duration::from_secs(config.remote.interval_secs),
        );
        let token = cancel.child_token();
        handles.push(("remote source", tokio::spawn(remote.run(token))));
    }

    {
        let index = index.clone();
        let token = cancel.child_token();
        let interval = Duration::from_secs(config.index.gc_interval_secs);
        let max_age = config.index.gc_max_age_secs as i64;
        handles.push((
            "index gc",
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    match index.prune_stale(max_age).await {
                        Ok(0) => {}
                        Ok(pruned) => info!("Index GC removed {} stale records", pruned),
                        Err(e) => error!("Index GC failed: {}", e),
                    }
                }
            }),
        ));
    }

    if let Some(batcher) = batcher.clone() {
        let token = cancel.child_token();
        let interval = Duration::from_secs(config.notifier.flush_interval_secs);
        handles.push((
            "notifier flush",
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    if batcher.pending_len().await > 0 {
                        batcher.flush().await;
                    }
                }
            }),
        ));
    }

    {
        let pipeline = pipeline.clone();
        let health = health.clone();
        let token = cancel.child_token();
        handles.push((
            "status report",
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(STATUS_INTERVAL) => {}
                    }
                    let report = StatusReport::collect(&pipeline, &health).await;
                    info!(
                        queue_depth = report.queue_depth,
                        failed_tasks = report.failed_tasks,
                        sources_ok = report.source_last_success.len(),
                        "Status"
                    );
                }
            }),
        ));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the shutdown signal")?;
    info!("Shutdown signal received");

    cancel.cancel();
    for (name, handle) in handles {
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} panicked during shutdown: {}", name, e),
            Err(_) => warn!("{} timed out during shutdown", name),
        }
    }
    pipeline.shutdown(SHUTDOWN_TIMEOUT).await;

    // Links created right before shutdown still get announced.
    if let Some(batcher) = &batcher
        && batcher.pending_len().await > 0
    {
        batcher.flush().await;
    }

    info!("symflow stopped");
    Ok(())
}
