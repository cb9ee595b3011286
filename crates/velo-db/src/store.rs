//! Reconciler-owned tables.
//!
//! One [`SnapshotChanges`] is written as one transaction together with the
//! consumer checkpoint. Every write is keyed so that applying the same
//! changes twice leaves the tables unchanged:
//! - stays: `(bike_number, station_uid, start_time)`
//! - movements: `(bike_number, start_time)`
//! - assignments: `bike_number`, only moved forward in time

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use velo_reconcile::{ReconcileState, SnapshotChanges};
use velo_schemas::{BikeAssignment, SequenceId, StationInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The checkpoint already covers this sequence id; nothing was written.
    AlreadyCommitted,
}

/// Row counts, for status output and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub stations: i64,
    pub stays: i64,
    pub open_stays: i64,
    pub movements: i64,
    pub assignments: i64,
}

#[async_trait::async_trait]
pub trait ReconcileStore: Send + Sync {
    /// Current assignments plus known station coordinates.
    async fn load_state(&self) -> Result<ReconcileState>;

    async fn checkpoint(&self, consumer_id: &str) -> Result<Option<SequenceId>>;

    /// Write `changes` and advance `consumer_id` to `changes.sequence_id`
    /// atomically. On error nothing is written.
    async fn apply(&self, consumer_id: &str, changes: &SnapshotChanges) -> Result<ApplyOutcome>;

    /// Recompute `bike_assignment` from the latest open stay per bike.
    /// Returns the number of assignments written.
    async fn rebuild_assignments(&self) -> Result<u64>;

    async fn counts(&self) -> Result<StoreCounts>;
}

#[derive(Debug, Clone)]
pub struct PgReconcileStore {
    pool: PgPool,
}

impl PgReconcileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ReconcileStore for PgReconcileStore {
    async fn load_state(&self) -> Result<ReconcileState> {
        let assignments: Vec<(String, i64, DateTime<Utc>)> = sqlx::query_as(
            "select bike_number, station_uid, since from bike_assignment",
        )
        .fetch_all(&self.pool)
        .await
        .context("load bike_assignment failed")?;

        let stations: Vec<(i64, String, f64, f64)> =
            sqlx::query_as("select uid, name, lat, lng from stations")
                .fetch_all(&self.pool)
                .await
                .context("load stations failed")?;

        Ok(ReconcileState::from_rows(
            assignments
                .into_iter()
                .map(|(bike_number, station_uid, since)| BikeAssignment {
                    bike_number,
                    station_uid,
                    since,
                })
                .collect(),
            stations
                .into_iter()
                .map(|(uid, name, lat, lng)| StationInfo {
                    uid,
                    name,
                    lat,
                    lng,
                })
                .collect(),
        ))
    }

    async fn checkpoint(&self, consumer_id: &str) -> Result<Option<SequenceId>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "select last_committed_sequence_id from checkpoints where consumer_id = $1",
        )
        .bind(consumer_id)
        .fetch_optional(&self.pool)
        .await
        .context("checkpoint lookup failed")?;
        Ok(row.map(|(s,)| s))
    }

    async fn apply(&self, consumer_id: &str, changes: &SnapshotChanges) -> Result<ApplyOutcome> {
        let seq = changes.sequence_id;
        let mut tx = self.pool.begin().await.context("apply begin failed")?;

        // Serializes appliers of the same consumer and absorbs redelivery.
        sqlx::query(
            r#"
            insert into checkpoints (consumer_id, last_committed_sequence_id)
            values ($1, 0)
            on conflict (consumer_id) do nothing
            "#,
        )
        .bind(consumer_id)
        .execute(&mut *tx)
        .await
        .context("apply checkpoint ensure failed")?;

        let (current,): (i64,) = sqlx::query_as(
            "select last_committed_sequence_id from checkpoints where consumer_id = $1 for update",
        )
        .bind(consumer_id)
        .fetch_one(&mut *tx)
        .await
        .context("apply checkpoint lock failed")?;

        if current >= seq {
            tx.rollback().await.context("apply rollback failed")?;
            return Ok(ApplyOutcome::AlreadyCommitted);
        }

        for st in &changes.stations {
            sqlx::query(
                r#"
                insert into stations (uid, name, lat, lng, last_seen_at)
                values ($1, $2, $3, $4, $5)
                on conflict (uid) do update set
                  name = excluded.name,
                  lat = excluded.lat,
                  lng = excluded.lng,
                  last_seen_at = excluded.last_seen_at
                where stations.last_seen_at <= excluded.last_seen_at
                "#,
            )
            .bind(st.uid)
            .bind(&st.name)
            .bind(st.lat)
            .bind(st.lng)
            .bind(changes.polled_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("upsert station failed uid={}", st.uid))?;
        }

        // Close before open: the open-stay index allows one open stay per bike.
        // A stay already closed keeps its original end_time.
        for c in &changes.closed_stays {
            sqlx::query(
                r#"
                insert into stays (bike_number, station_uid, start_time, end_time)
                values ($1, $2, $3, $4)
                on conflict (bike_number, station_uid, start_time) do update set
                  end_time = excluded.end_time
                where stays.end_time is null
                "#,
            )
            .bind(&c.bike_number)
            .bind(c.station_uid)
            .bind(c.start_time)
            .bind(c.end_time)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("close stay failed bike_number={}", c.bike_number))?;
        }

        for s in &changes.opened_stays {
            sqlx::query(
                r#"
                insert into stays (bike_number, station_uid, start_time, end_time)
                values ($1, $2, $3, null)
                on conflict (bike_number, station_uid, start_time) do nothing
                "#,
            )
            .bind(&s.bike_number)
            .bind(s.station_uid)
            .bind(s.start_time)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("open stay failed bike_number={}", s.bike_number))?;
        }

        for m in &changes.movements {
            sqlx::query(
                r#"
                insert into movements (
                  bike_number, start_station_uid, end_station_uid,
                  start_time, end_time, distance_km
                ) values ($1, $2, $3, $4, $5, $6)
                on conflict (bike_number, start_time) do nothing
                "#,
            )
            .bind(&m.bike_number)
            .bind(m.start_station_uid)
            .bind(m.end_station_uid)
            .bind(m.start_time)
            .bind(m.end_time)
            .bind(m.distance_km)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("insert movement failed bike_number={}", m.bike_number))?;
        }

        for a in &changes.assignments {
            sqlx::query(
                r#"
                insert into bike_assignment (bike_number, station_uid, since)
                values ($1, $2, $3)
                on conflict (bike_number) do update set
                  station_uid = excluded.station_uid,
                  since = excluded.since
                where bike_assignment.since <= excluded.since
                "#,
            )
            .bind(&a.bike_number)
            .bind(a.station_uid)
            .bind(a.since)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("upsert assignment failed bike_number={}", a.bike_number))?;
        }

        sqlx::query(
            r#"
            update checkpoints set
              last_committed_sequence_id = greatest(last_committed_sequence_id, $2),
              updated_at = now()
            where consumer_id = $1
            "#,
        )
        .bind(consumer_id)
        .bind(seq)
        .execute(&mut *tx)
        .await
        .context("advance checkpoint failed")?;

        tx.commit()
            .await
            .with_context(|| format!("apply commit failed sequence_id={seq}"))?;

        Ok(ApplyOutcome::Applied)
    }

    async fn rebuild_assignments(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("rebuild begin failed")?;

        sqlx::query("delete from bike_assignment")
            .execute(&mut *tx)
            .await
            .context("rebuild clear failed")?;

        let n = sqlx::query(
            r#"
            insert into bike_assignment (bike_number, station_uid, since)
            select distinct on (bike_number) bike_number, station_uid, start_time
            from stays
            where end_time is null
            order by bike_number, start_time desc
            "#,
        )
        .execute(&mut *tx)
        .await
        .context("rebuild insert failed")?
        .rows_affected();

        tx.commit().await.context("rebuild commit failed")?;
        Ok(n)
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let (stations, stays, open_stays, movements, assignments): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                select
                  (select count(*) from stations)::bigint,
                  (select count(*) from stays)::bigint,
                  (select count(*) from stays where end_time is null)::bigint,
                  (select count(*) from movements)::bigint,
                  (select count(*) from bike_assignment)::bigint
                "#,
            )
            .fetch_one(&self.pool)
            .await
            .context("store counts failed")?;

        Ok(StoreCounts {
            stations,
            stays,
            open_stays,
            movements,
            assignments,
        })
    }
}
