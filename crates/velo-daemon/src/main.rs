//! velo-daemon entry point.
//!
//! Loads config, connects and migrates the database, then runs the poller,
//! the reconciler and the log pruner until Ctrl-C. Each loop finishes its
//! in-flight unit of work before the process exits.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use velo_config::{report_unused_keys, resolve_database_url, UnusedKeyPolicy};
use velo_db::{PgReconcileStore, PgSnapshotLog, ReconcileStore, SnapshotLog};
use velo_feed::{FeedProvider, NextbikeFeedProvider};
use velo_runtime::{
    run_prune_loop, shutdown_channel, Poller, PollerSettings, Reconciler, ReconcilerSettings,
};

/// Comma-separated config layers, base first.
const ENV_CONFIG_PATHS: &str = "VELO_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/defaults/base.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env.local if present (dev convenience). Production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let paths = config_paths_from_env();
    let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    let loaded = velo_config::load_layered_yaml(&path_refs)?;

    let unused = report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Warn)?;
    for pointer in &unused.unused_leaf_pointers {
        warn!(pointer = %pointer, "config key is not used by any section");
    }

    let cfg = loaded.pipeline()?;
    info!(config_hash = %loaded.config_hash, layers = ?paths, "config loaded");

    let db_url = resolve_database_url(&cfg.database)?;
    let pool = velo_db::connect(db_url.expose(), cfg.database.max_connections).await?;
    velo_db::migrate(&pool).await?;
    info!(env = %db_url.env_name, "database ready");

    let feed: Arc<dyn FeedProvider> = Arc::new(NextbikeFeedProvider::new(
        cfg.feed.url.clone(),
        cfg.feed.request_timeout(),
    )?);
    let log: Arc<dyn SnapshotLog> = Arc::new(PgSnapshotLog::new(pool.clone()));
    let store: Arc<dyn ReconcileStore> = Arc::new(PgReconcileStore::new(pool));

    let (trigger, shutdown) = shutdown_channel();

    let poller = Poller::new(feed, Arc::clone(&log), PollerSettings::from_config(&cfg));
    let reconciler = Reconciler::new(
        Arc::clone(&log),
        store,
        ReconcilerSettings::from_config(&cfg),
    );

    let poll_task = tokio::spawn(poller.run(shutdown.clone()));
    let reconcile_task = tokio::spawn(reconciler.run(shutdown.clone()));
    let prune_task = tokio::spawn(run_prune_loop(
        log,
        cfg.log.retention(),
        cfg.log.prune_interval(),
        shutdown,
    ));

    info!(feed_url = %cfg.feed.url, "velo-daemon running; Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");
    trigger.trigger();

    match poll_task.await {
        Ok(stats) => info!(?stats, "poller joined"),
        Err(e) => error!(error = %e, "poller task failed"),
    }
    match reconcile_task.await {
        Ok(stats) => info!(?stats, "reconciler joined"),
        Err(e) => error!(error = %e, "reconciler task failed"),
    }
    if let Err(e) = prune_task.await {
        error!(error = %e, "prune task failed");
    }

    info!("velo-daemon stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn config_paths_from_env() -> Vec<String> {
    match std::env::var(ENV_CONFIG_PATHS) {
        Ok(v) if !v.trim().is_empty() => v
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        _ => vec![DEFAULT_CONFIG_PATH.to_string()],
    }
}
