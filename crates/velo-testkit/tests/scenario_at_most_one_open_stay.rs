//! Scenario: noisy feed (bikes hop, vanish, and get listed twice). After every
//! processed snapshot each bike has at most one open stay, and its
//! assignment points at exactly that stay.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use velo_runtime::{Reconciler, ReconcilerSettings};
use velo_schemas::{Snapshot, StationSample};
use velo_testkit::{snapshot, station, t, MemoryReconcileStore, MemorySnapshotLog, StoreDump};

const STATIONS: [i64; 4] = [100, 200, 300, 400];
const BIKES: usize = 10;
const SNAPSHOTS: i64 = 40;

/// Small deterministic generator so the history is reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

fn noisy_history() -> Vec<Snapshot> {
    let mut rng = Lcg(42);
    (0..SNAPSHOTS)
        .map(|i| {
            let mut at: BTreeMap<i64, Vec<String>> = BTreeMap::new();
            for bike in 0..BIKES {
                let roll = rng.next() % 10;
                let home = STATIONS[(rng.next() % STATIONS.len() as u64) as usize];
                match roll {
                    // Vanished this round.
                    0 => {}
                    // Listed at two stations.
                    1 => {
                        let other = STATIONS[(rng.next() % STATIONS.len() as u64) as usize];
                        at.entry(home).or_default().push(bike.to_string());
                        at.entry(other).or_default().push(bike.to_string());
                    }
                    _ => at.entry(home).or_default().push(bike.to_string()),
                }
            }
            let stations: Vec<StationSample> = STATIONS
                .iter()
                .map(|uid| {
                    let bikes = at.remove(uid).unwrap_or_default();
                    let refs: Vec<&str> = bikes.iter().map(String::as_str).collect();
                    station(*uid, &refs)
                })
                .collect();
            snapshot(t(i * 3), stations)
        })
        .collect()
}

fn check_invariants(dump: &StoreDump, step: usize) {
    for bike in 0..BIKES {
        let bike = bike.to_string();
        let open = dump.open_stays_for(&bike);
        assert!(open.len() <= 1, "step {step}: bike {bike} has {} open stays", open.len());

        match dump.assignments.get(&bike) {
            Some(a) => {
                assert_eq!(open.len(), 1, "step {step}: assigned bike {bike} has no open stay");
                assert_eq!((open[0].station_uid, open[0].start_time), (a.station_uid, a.since));
            }
            None => assert!(open.is_empty(), "step {step}: unassigned bike {bike} has an open stay"),
        }
    }

    for m in dump.movements.values() {
        assert!(m.end_time > m.start_time);
        assert_ne!(m.start_station_uid, m.end_station_uid);
        assert!(m.distance_km >= 0.0);
    }
}

#[tokio::test]
async fn invariants_hold_after_every_snapshot() {
    let store = Arc::new(MemoryReconcileStore::new());
    let log = Arc::new(MemorySnapshotLog::with_snapshots(noisy_history()));
    let mut reconciler = Reconciler::new(
        log,
        store.clone(),
        ReconcilerSettings {
            consumer_id: "reconciler".to_string(),
            batch_size: 1,
            idle_poll: Duration::from_millis(1),
            retry_backoff: Duration::from_millis(1),
        },
    );

    for step in 1..=SNAPSHOTS as usize {
        assert_eq!(reconciler.run_once().await.unwrap(), 1);
        check_invariants(&store.dump(), step);
    }

    assert_eq!(reconciler.run_once().await.unwrap(), 0);
    assert!(reconciler.stats().movements > 0);
    assert!(reconciler.stats().anomalies > 0, "double listings are reported");
}
