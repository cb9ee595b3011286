//! Scenario: the assignment table is derived state. Rebuilding it from the
//! open stays reproduces what the reconciler wrote.

use std::sync::Arc;
use std::time::Duration;

use velo_db::ReconcileStore;
use velo_runtime::{Reconciler, ReconcilerSettings};
use velo_testkit::{
    snapshot, station, t, MemoryReconcileStore, MemorySnapshotLog, STATION_A, STATION_B,
};

#[tokio::test]
async fn rebuild_restores_damaged_assignments() {
    let store = Arc::new(MemoryReconcileStore::new());
    let log = Arc::new(MemorySnapshotLog::with_snapshots([
        snapshot(t(0), vec![station(STATION_A, &["1", "2"]), station(STATION_B, &[])]),
        snapshot(t(4), vec![station(STATION_A, &["2"]), station(STATION_B, &["1"])]),
    ]));
    Reconciler::new(
        log,
        store.clone(),
        ReconcilerSettings {
            consumer_id: "reconciler".to_string(),
            batch_size: 10,
            idle_poll: Duration::from_millis(1),
            retry_backoff: Duration::from_millis(1),
        },
    )
    .drain()
    .await
    .unwrap();

    let intact = store.dump().assignments;
    store.forget_assignment("1");
    assert_eq!(store.counts().await.unwrap().assignments, 1);

    assert_eq!(store.rebuild_assignments().await.unwrap(), 2);
    assert_eq!(store.dump().assignments, intact);
    assert_eq!(intact["1"].station_uid, STATION_B);
    assert_eq!(intact["1"].since, t(4));
}
