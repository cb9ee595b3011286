//! Scenario: a bike moves between two stations and the resulting changes are
//! written to Postgres. Re-applying the same changes (same consumer, or a
//! second consumer) adds no rows; rebuild restores the assignment table.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use velo_db::{ApplyOutcome, PgReconcileStore, ReconcileStore};
use velo_reconcile::{distance_km, reconcile_snapshot, ReconcileState};
use velo_schemas::{LogEntry, Snapshot, StationSample};

async fn pool() -> anyhow::Result<Option<sqlx::PgPool>> {
    let url = match std::env::var(velo_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: {} not set", velo_db::ENV_DB_URL);
            return Ok(None);
        }
    };
    let pool = velo_db::connect(&url, 2).await?;
    velo_db::migrate(&pool).await?;
    Ok(Some(pool))
}

fn station(uid: i64, lat: f64, lng: f64, bikes: &[&str]) -> StationSample {
    StationSample {
        uid,
        name: format!("store-test-{uid}"),
        lat,
        lng,
        bikes_present: bikes.iter().map(|b| b.to_string()).collect(),
    }
}

fn entry(seq: i64, at: DateTime<Utc>, stations: Vec<StationSample>) -> LogEntry {
    LogEntry {
        sequence_id: seq,
        snapshot: Snapshot::new(at, stations),
    }
}

async fn bike_rows(pool: &sqlx::PgPool, bike: &str) -> anyhow::Result<(i64, i64, i64)> {
    let row: (i64, i64, i64) = sqlx::query_as(
        r#"
        select
          (select count(*) from stays where bike_number = $1)::bigint,
          (select count(*) from stays where bike_number = $1 and end_time is null)::bigint,
          (select count(*) from movements where bike_number = $1)::bigint
        "#,
    )
    .bind(bike)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

#[tokio::test]
async fn move_is_written_once_and_replay_is_absorbed() -> anyhow::Result<()> {
    let Some(pool) = pool().await? else {
        return Ok(());
    };
    let store = PgReconcileStore::new(pool.clone());

    let tag = Utc::now().timestamp_micros();
    let consumer = format!("store-test-{tag}");
    let bike = format!("S{tag}");
    let a = 7_000_000_000 + (tag % 1_000_000_000) * 2;
    let b = a + 1;
    let t1 = Utc::now().trunc_subsecs(6);
    let t2 = t1 + Duration::minutes(5);

    let e1 = entry(1, t1, vec![station(a, 51.05, 13.73, &[&bike]), station(b, 51.03, 13.72, &[])]);
    let e2 = entry(2, t2, vec![station(a, 51.05, 13.73, &[]), station(b, 51.03, 13.72, &[&bike])]);

    let state = store.load_state().await?;
    let c1 = reconcile_snapshot(&state, &e1);
    assert_eq!(store.apply(&consumer, &c1).await?, ApplyOutcome::Applied);

    let state = store.load_state().await?;
    assert_eq!(state.assignment(&bike).map(|x| x.station_uid), Some(a));
    let c2 = reconcile_snapshot(&state, &e2);
    assert_eq!(c2.movements.len(), 1);
    assert_eq!(store.apply(&consumer, &c2).await?, ApplyOutcome::Applied);
    assert_eq!(store.checkpoint(&consumer).await?, Some(2));

    assert_eq!(bike_rows(&pool, &bike).await?, (2, 1, 1));

    let (start_station, end_station, start_time, end_time, dist): (i64, i64, DateTime<Utc>, DateTime<Utc>, f64) =
        sqlx::query_as(
            "select start_station_uid, end_station_uid, start_time, end_time, distance_km from movements where bike_number = $1",
        )
        .bind(&bike)
        .fetch_one(&pool)
        .await?;
    assert_eq!((start_station, end_station), (a, b));
    assert_eq!((start_time, end_time), (t1, t2));
    assert!((dist - distance_km(51.05, 13.73, 51.03, 13.72)).abs() < 1e-6);

    // Redelivery under the same consumer is refused by the checkpoint.
    assert_eq!(store.apply(&consumer, &c1).await?, ApplyOutcome::AlreadyCommitted);
    assert_eq!(store.apply(&consumer, &c2).await?, ApplyOutcome::AlreadyCommitted);

    // A second consumer writing the same changes is absorbed by the row keys.
    let other = format!("{consumer}-b");
    assert_eq!(store.apply(&other, &c1).await?, ApplyOutcome::Applied);
    assert_eq!(store.apply(&other, &c2).await?, ApplyOutcome::Applied);
    assert_eq!(bike_rows(&pool, &bike).await?, (2, 1, 1));

    let state = store.load_state().await?;
    let assigned = state.assignment(&bike).cloned();
    assert_eq!(assigned.as_ref().map(|x| (x.station_uid, x.since)), Some((b, t2)));

    sqlx::query("delete from bike_assignment where bike_number = $1")
        .bind(&bike)
        .execute(&pool)
        .await?;
    assert!(store.rebuild_assignments().await? >= 1);
    let rebuilt = store.load_state().await?;
    assert_eq!(rebuilt.assignment(&bike).cloned(), assigned);

    let counts = store.counts().await?;
    assert!(counts.open_stays <= counts.stays);
    assert!(counts.movements >= 1);

    sqlx::query("delete from checkpoints where consumer_id like $1")
        .bind(format!("{consumer}%"))
        .execute(&pool)
        .await?;
    Ok(())
}

#[tokio::test]
async fn failed_transaction_leaves_no_partial_rows() -> anyhow::Result<()> {
    let Some(pool) = pool().await? else {
        return Ok(());
    };
    let store = PgReconcileStore::new(pool.clone());

    let tag = Utc::now().timestamp_micros();
    let consumer = format!("store-fail-{tag}");
    let bike = format!("F{tag}");
    let uid = 8_000_000_000 + (tag % 1_000_000_000);
    let t1 = Utc::now().trunc_subsecs(6);

    let mut changes =
        reconcile_snapshot(&ReconcileState::empty(), &entry(1, t1, vec![station(uid, 51.0, 13.7, &[&bike])]));
    // A movement with end_time == start_time violates a table check, after
    // the stay insert has already run inside the transaction.
    changes.movements.push(velo_schemas::Movement {
        bike_number: bike.clone(),
        start_station_uid: uid,
        end_station_uid: uid + 1,
        start_time: t1,
        end_time: t1,
        distance_km: 0.0,
    });

    assert!(store.apply(&consumer, &changes).await.is_err());
    assert_eq!(bike_rows(&pool, &bike).await?, (0, 0, 0));
    assert_eq!(store.checkpoint(&consumer).await?, None);
    Ok(())
}
