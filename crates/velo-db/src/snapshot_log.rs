//! Durable, ordered snapshot log with per-consumer checkpoints.
//!
//! Delivery is at-least-once: a consumer that crashes between reading an
//! entry and committing it sees the entry again on the next `read_from`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use sqlx::{PgPool, Row};
use velo_schemas::{Checkpoint, LogEntry, SequenceId, Snapshot};

/// Result of one retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Lowest checkpoint over all registered consumers; `None` when no
    /// consumer is registered (nothing is eligible then).
    pub horizon: Option<SequenceId>,
    pub deleted: u64,
}

#[async_trait::async_trait]
pub trait SnapshotLog: Send + Sync {
    /// Append a snapshot; the log assigns the sequence id.
    async fn append(&self, snapshot: &Snapshot) -> Result<SequenceId>;

    /// Entries with `sequence_id > after`, ascending, at most `limit`.
    ///
    /// Produced lazily. Restartable from any sequence id previously returned.
    /// The Postgres implementation keeps a pool connection checked out until
    /// the stream is dropped.
    fn read_from<'a>(
        &'a self,
        consumer_id: &'a str,
        after: SequenceId,
        limit: i64,
    ) -> BoxStream<'a, Result<LogEntry>>;

    /// Record consumer progress. Never moves a checkpoint backwards.
    async fn commit(&self, consumer_id: &str, sequence_id: SequenceId) -> Result<()>;

    /// Last committed position, `None` for an unknown consumer.
    async fn committed(&self, consumer_id: &str) -> Result<Option<SequenceId>>;

    /// Register a consumer (at position 0 if new) and return its position.
    async fn register_consumer(&self, consumer_id: &str) -> Result<SequenceId>;

    /// Highest sequence id currently stored.
    async fn head(&self) -> Result<Option<SequenceId>>;

    async fn consumers(&self) -> Result<Vec<Checkpoint>>;

    /// Delete entries committed by every registered consumer and appended
    /// before `retain_after`.
    async fn prune(&self, retain_after: DateTime<Utc>) -> Result<PruneReport>;
}

#[derive(Debug, Clone)]
pub struct PgSnapshotLog {
    pool: PgPool,
}

impl PgSnapshotLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Number of entries currently retained.
    pub async fn len(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("select count(*)::bigint from snapshot_log")
            .fetch_one(&self.pool)
            .await
            .context("snapshot_log count failed")?;
        Ok(n)
    }
}

fn decode_entry(row: sqlx::postgres::PgRow) -> Result<LogEntry> {
    let sequence_id: i64 = row
        .try_get("sequence_id")
        .context("snapshot_log row missing sequence_id")?;
    let payload: Value = row
        .try_get("payload")
        .with_context(|| format!("snapshot_log payload read failed sequence_id={sequence_id}"))?;
    let snapshot: Snapshot = serde_json::from_value(payload)
        .with_context(|| format!("snapshot_log payload decode failed sequence_id={sequence_id}"))?;
    Ok(LogEntry {
        sequence_id,
        snapshot,
    })
}

#[async_trait::async_trait]
impl SnapshotLog for PgSnapshotLog {
    async fn append(&self, snapshot: &Snapshot) -> Result<SequenceId> {
        let payload = serde_json::to_value(snapshot).context("serialize snapshot failed")?;

        let (seq,): (i64,) = sqlx::query_as(
            r#"
            insert into snapshot_log (polled_at, payload)
            values ($1, $2)
            returning sequence_id
            "#,
        )
        .bind(snapshot.polled_at)
        .bind(payload)
        .fetch_one(&self.pool)
        .await
        .context("snapshot_log append failed")?;

        Ok(seq)
    }

    fn read_from<'a>(
        &'a self,
        consumer_id: &'a str,
        after: SequenceId,
        limit: i64,
    ) -> BoxStream<'a, Result<LogEntry>> {
        tracing::debug!(consumer_id, after, limit, "snapshot_log read_from");

        sqlx::query(
            r#"
            select sequence_id, payload
            from snapshot_log
            where sequence_id > $1
            order by sequence_id asc
            limit $2
            "#,
        )
        .bind(after)
        .bind(limit)
        .fetch(&self.pool)
        .map(|row| {
            let row = row.context("snapshot_log read failed")?;
            decode_entry(row)
        })
        .boxed()
    }

    async fn commit(&self, consumer_id: &str, sequence_id: SequenceId) -> Result<()> {
        sqlx::query(
            r#"
            insert into checkpoints (consumer_id, last_committed_sequence_id, updated_at)
            values ($1, $2, now())
            on conflict (consumer_id) do update set
              last_committed_sequence_id =
                greatest(checkpoints.last_committed_sequence_id, excluded.last_committed_sequence_id),
              updated_at = now()
            "#,
        )
        .bind(consumer_id)
        .bind(sequence_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("log commit failed consumer_id={consumer_id}"))?;
        Ok(())
    }

    async fn committed(&self, consumer_id: &str) -> Result<Option<SequenceId>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "select last_committed_sequence_id from checkpoints where consumer_id = $1",
        )
        .bind(consumer_id)
        .fetch_optional(&self.pool)
        .await
        .context("checkpoint lookup failed")?;
        Ok(row.map(|(s,)| s))
    }

    async fn register_consumer(&self, consumer_id: &str) -> Result<SequenceId> {
        sqlx::query(
            r#"
            insert into checkpoints (consumer_id, last_committed_sequence_id)
            values ($1, 0)
            on conflict (consumer_id) do nothing
            "#,
        )
        .bind(consumer_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("register consumer failed consumer_id={consumer_id}"))?;

        Ok(self.committed(consumer_id).await?.unwrap_or(0))
    }

    async fn head(&self) -> Result<Option<SequenceId>> {
        let (head,): (Option<i64>,) = sqlx::query_as("select max(sequence_id) from snapshot_log")
            .fetch_one(&self.pool)
            .await
            .context("snapshot_log head failed")?;
        Ok(head)
    }

    async fn consumers(&self) -> Result<Vec<Checkpoint>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            select consumer_id, last_committed_sequence_id
            from checkpoints
            order by consumer_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("list consumers failed")?;

        Ok(rows
            .into_iter()
            .map(|(consumer_id, last_committed_sequence_id)| Checkpoint {
                consumer_id,
                last_committed_sequence_id,
            })
            .collect())
    }

    async fn prune(&self, retain_after: DateTime<Utc>) -> Result<PruneReport> {
        let mut tx = self.pool.begin().await.context("prune begin failed")?;

        // Row locks keep a concurrent commit from racing the horizon.
        let (horizon,): (Option<i64>,) = sqlx::query_as(
            "select min(last_committed_sequence_id) from (select last_committed_sequence_id from checkpoints for share) c",
        )
        .fetch_one(&mut *tx)
        .await
        .context("prune horizon query failed")?;

        let deleted = match horizon {
            Some(h) => sqlx::query(
                r#"
                delete from snapshot_log
                where sequence_id <= $1
                  and appended_at < $2
                "#,
            )
            .bind(h)
            .bind(retain_after)
            .execute(&mut *tx)
            .await
            .context("prune delete failed")?
            .rows_affected(),
            None => 0,
        };

        tx.commit().await.context("prune commit failed")?;

        Ok(PruneReport { horizon, deleted })
    }
}
