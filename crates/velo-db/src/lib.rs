//! velo-db
//!
//! Postgres persistence for the pipeline: the snapshot log and the
//! reconciler-owned tables (`stations`, `stays`, `movements`,
//! `bike_assignment`, `checkpoints`).
//!
//! The runtime only sees the [`SnapshotLog`] and [`ReconcileStore`] traits;
//! the `Pg*` types here are the production implementations.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

mod snapshot_log;
mod store;

pub use snapshot_log::{PgSnapshotLog, PruneReport, SnapshotLog};
pub use store::{ApplyOutcome, PgReconcileStore, ReconcileStore, StoreCounts};

pub const ENV_DB_URL: &str = "VELO_DATABASE_URL";

/// Connect to Postgres.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Connect to Postgres using VELO_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url, 10).await
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_log_table: bool,
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='snapshot_log'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_log_table: exists,
    })
}
