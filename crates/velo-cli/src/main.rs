use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use velo_config::{resolve_database_url, LogConfig, PipelineConfig};
use velo_db::{PgReconcileStore, PgSnapshotLog, ReconcileStore, SnapshotLog};
use velo_feed::NextbikeFeedProvider;
use velo_runtime::{
    prune_once, Poller, PollerSettings, Reconciler, ReconcilerSettings, TickOutcome,
};

#[derive(Parser)]
#[command(name = "velo")]
#[command(about = "Bike-share ingestion pipeline CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands (connect via VELO_DATABASE_URL)
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> local...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Poller commands
    Poll {
        #[command(subcommand)]
        cmd: PollCmd,
    },

    /// Reconciler commands
    Reconcile {
        #[command(subcommand)]
        cmd: ReconcileCmd,
    },

    /// Snapshot log maintenance
    Log {
        #[command(subcommand)]
        cmd: LogCmd,
    },

    /// Reconciler-owned tables
    State {
        #[command(subcommand)]
        cmd: StateCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    /// Apply SQL migrations.
    Migrate,
}

#[derive(Subcommand)]
enum PollCmd {
    /// Fetch the feed once and append the snapshot to the log.
    Once {
        /// Layered config paths in merge order
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ReconcileCmd {
    /// Process one batch from the log (or everything with --drain).
    Once {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        /// Keep going until the log is exhausted.
        #[arg(long, default_value_t = false)]
        drain: bool,
    },
}

#[derive(Subcommand)]
enum LogCmd {
    /// Print head position and every consumer's checkpoint and lag.
    Status {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,
    },

    /// Delete entries every consumer has committed and that are past retention.
    Prune {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        /// Override `log.retention_hours`.
        #[arg(long)]
        retention_hours: Option<u64>,
    },
}

#[derive(Subcommand)]
enum StateCmd {
    /// Row counts of the reconciler tables.
    Counts {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,
    },

    /// Recompute bike_assignment from the latest open stay per bike.
    RebuildAssignments {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env.local if present (dev convenience).
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = velo_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = velo_db::status(&pool).await?;
                    println!("db_ok={} has_log_table={}", s.ok, s.has_log_table);
                }
                DbCmd::Migrate => {
                    velo_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = velo_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Poll {
            cmd: PollCmd::Once { config_paths },
        } => {
            let (cfg, pool) = load_and_connect(&config_paths).await?;
            let feed = Arc::new(NextbikeFeedProvider::new(
                cfg.feed.url.clone(),
                cfg.feed.request_timeout(),
            )?);
            let log = Arc::new(PgSnapshotLog::new(pool));
            let mut poller = Poller::new(feed, log, PollerSettings::from_config(&cfg));

            match poller.tick().await {
                TickOutcome::Appended { sequence_id } => {
                    println!("outcome=appended sequence_id={sequence_id}")
                }
                other => anyhow::bail!("POLL_SKIPPED: outcome={other:?}"),
            }
        }

        Commands::Reconcile {
            cmd: ReconcileCmd::Once {
                config_paths,
                drain,
            },
        } => {
            let (cfg, pool) = load_and_connect(&config_paths).await?;
            let log = Arc::new(PgSnapshotLog::new(pool.clone()));
            let store = Arc::new(PgReconcileStore::new(pool));
            let mut reconciler =
                Reconciler::new(log, store, ReconcilerSettings::from_config(&cfg));

            let read = if drain {
                reconciler.drain().await?
            } else {
                reconciler.run_once().await?
            };

            let s = reconciler.stats();
            println!("consumer_id={}", reconciler.consumer_id());
            println!("entries_read={read}");
            println!("applied={}", s.applied);
            println!("replayed={}", s.replayed);
            println!("movements={}", s.movements);
            println!("stays_opened={}", s.stays_opened);
            println!("stays_closed={}", s.stays_closed);
            println!("anomalies={}", s.anomalies);
            println!(
                "checkpoint={}",
                reconciler
                    .committed()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string())
            );
        }

        Commands::Log { cmd } => match cmd {
            LogCmd::Status { config_paths } => {
                let (_cfg, pool) = load_and_connect(&config_paths).await?;
                let log = PgSnapshotLog::new(pool);
                let head = log.head().await?;
                println!(
                    "head={}",
                    head.map(|h| h.to_string())
                        .unwrap_or_else(|| "none".to_string())
                );
                println!("entries={}", log.len().await?);
                for c in log.consumers().await? {
                    let lag = head.unwrap_or(0).saturating_sub(c.last_committed_sequence_id);
                    println!(
                        "consumer={} committed={} lag={}",
                        c.consumer_id, c.last_committed_sequence_id, lag
                    );
                }
            }
            LogCmd::Prune {
                config_paths,
                retention_hours,
            } => {
                let retention_override = retention_hours.map(retention_from_hours).transpose()?;
                let (cfg, pool) = load_and_connect(&config_paths).await?;
                let log = PgSnapshotLog::new(pool);
                let retention = retention_override.unwrap_or_else(|| cfg.log.retention());
                let report = prune_once(&log, retention).await?;
                println!(
                    "deleted={} horizon={}",
                    report.deleted,
                    report
                        .horizon
                        .map(|h| h.to_string())
                        .unwrap_or_else(|| "none".to_string())
                );
            }
        },

        Commands::State { cmd } => match cmd {
            StateCmd::Counts { config_paths } => {
                let (_cfg, pool) = load_and_connect(&config_paths).await?;
                let counts = PgReconcileStore::new(pool).counts().await?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&counts).context("serialize counts failed")?
                );
            }
            StateCmd::RebuildAssignments { config_paths } => {
                let (_cfg, pool) = load_and_connect(&config_paths).await?;
                let n = PgReconcileStore::new(pool).rebuild_assignments().await?;
                println!("assignments_rebuilt={n}");
            }
        },
    }

    Ok(())
}

fn retention_from_hours(hours: u64) -> Result<Duration> {
    if hours > LogConfig::MAX_RETENTION_HOURS {
        anyhow::bail!(
            "RETENTION_INVALID: --retention-hours must be <= {}",
            LogConfig::MAX_RETENTION_HOURS
        );
    }
    Ok(Duration::from_secs(hours * 3_600))
}

/// Load layered config, resolve the database URL from the env var it
/// names, connect and make sure the schema is current.
async fn load_and_connect(config_paths: &[String]) -> Result<(PipelineConfig, PgPool)> {
    let path_refs: Vec<&str> = config_paths.iter().map(|s| s.as_str()).collect();
    let loaded = velo_config::load_layered_yaml(&path_refs)?;
    let cfg = loaded.pipeline()?;
    tracing::debug!(config_hash = %loaded.config_hash, "config loaded");

    let url = resolve_database_url(&cfg.database)?;
    let pool = velo_db::connect(url.expose(), cfg.database.max_connections).await?;
    velo_db::migrate(&pool).await?;
    Ok((cfg, pool))
}

fn init_tracing() {
    // stdout carries command output; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();
}
