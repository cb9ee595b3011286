use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use velo_db::{ApplyOutcome, ReconcileStore, StoreCounts};
use velo_reconcile::{ReconcileState, SnapshotChanges};
use velo_schemas::{BikeAssignment, Movement, SequenceId, StationInfo, StationUid, Stay};

type StayKey = (String, StationUid, DateTime<Utc>);

/// Full contents of a [`MemoryReconcileStore`], comparable across runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreDump {
    pub stations: BTreeMap<StationUid, StationInfo>,
    pub stays: BTreeMap<StayKey, Option<DateTime<Utc>>>,
    pub movements: BTreeMap<(String, DateTime<Utc>), Movement>,
    pub assignments: BTreeMap<String, BikeAssignment>,
    pub checkpoints: BTreeMap<String, SequenceId>,
}

impl StoreDump {
    pub fn stays_for(&self, bike_number: &str) -> Vec<Stay> {
        self.stays
            .iter()
            .filter(|((b, _, _), _)| b == bike_number)
            .map(|((b, uid, start), end)| Stay {
                bike_number: b.clone(),
                station_uid: *uid,
                start_time: *start,
                end_time: *end,
            })
            .collect()
    }

    pub fn open_stays_for(&self, bike_number: &str) -> Vec<Stay> {
        self.stays_for(bike_number)
            .into_iter()
            .filter(Stay::is_open)
            .collect()
    }

    pub fn movements_for(&self, bike_number: &str) -> Vec<Movement> {
        self.movements
            .values()
            .filter(|m| m.bike_number == bike_number)
            .cloned()
            .collect()
    }
}

#[derive(Default)]
struct Inner {
    tables: StoreDump,
    fail_applies: u32,
}

/// In-memory `ReconcileStore` with the same row keys and guards as the
/// Postgres store. `apply` works on a copy and swaps it in on success, so a
/// failure leaves the tables untouched.
#[derive(Default)]
pub struct MemoryReconcileStore {
    inner: Mutex<Inner>,
}

fn apply_to(t: &mut StoreDump, consumer_id: &str, changes: &SnapshotChanges) -> Result<()> {
    for st in &changes.stations {
        t.stations.insert(st.uid, st.clone());
    }

    for c in &changes.closed_stays {
        let key = (c.bike_number.clone(), c.station_uid, c.start_time);
        let end = t.stays.entry(key).or_insert(None);
        if end.is_none() {
            *end = Some(c.end_time);
        }
    }

    for s in &changes.opened_stays {
        let key = (s.bike_number.clone(), s.station_uid, s.start_time);
        if t.stays.contains_key(&key) {
            continue;
        }
        let already_open = t
            .stays
            .iter()
            .any(|((b, _, _), end)| *b == s.bike_number && end.is_none());
        if already_open {
            bail!(
                "unique violation: second open stay for bike_number={}",
                s.bike_number
            );
        }
        t.stays.insert(key, None);
    }

    for m in &changes.movements {
        t.movements.entry(m.key()).or_insert_with(|| m.clone());
    }

    for a in &changes.assignments {
        match t.assignments.get(&a.bike_number) {
            Some(cur) if cur.since > a.since => {}
            _ => {
                t.assignments.insert(a.bike_number.clone(), a.clone());
            }
        }
    }

    let cp = t.checkpoints.entry(consumer_id.to_string()).or_insert(0);
    *cp = (*cp).max(changes.sequence_id);
    Ok(())
}

impl MemoryReconcileStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The next `n` applies fail after writing part of the snapshot.
    pub fn fail_next_applies(&self, n: u32) {
        self.lock().fail_applies = n;
    }

    pub fn dump(&self) -> StoreDump {
        self.lock().tables.clone()
    }

    /// Remove one assignment row, as a damaged table would look.
    pub fn forget_assignment(&self, bike_number: &str) {
        self.lock().tables.assignments.remove(bike_number);
    }
}

#[async_trait::async_trait]
impl ReconcileStore for MemoryReconcileStore {
    async fn load_state(&self) -> Result<ReconcileState> {
        let g = self.lock();
        Ok(ReconcileState::from_rows(
            g.tables.assignments.values().cloned().collect(),
            g.tables.stations.values().cloned().collect(),
        ))
    }

    async fn checkpoint(&self, consumer_id: &str) -> Result<Option<SequenceId>> {
        Ok(self.lock().tables.checkpoints.get(consumer_id).copied())
    }

    async fn apply(&self, consumer_id: &str, changes: &SnapshotChanges) -> Result<ApplyOutcome> {
        let mut g = self.lock();

        let current = g.tables.checkpoints.get(consumer_id).copied().unwrap_or(0);
        if current >= changes.sequence_id {
            return Ok(ApplyOutcome::AlreadyCommitted);
        }

        let mut tx = g.tables.clone();
        if g.fail_applies > 0 {
            g.fail_applies -= 1;
            // Half the writes land in the copy, then the "connection" drops.
            for st in &changes.stations {
                tx.stations.insert(st.uid, st.clone());
            }
            drop(tx);
            bail!(
                "injected storage failure sequence_id={}",
                changes.sequence_id
            );
        }

        apply_to(&mut tx, consumer_id, changes)?;
        g.tables = tx;
        Ok(ApplyOutcome::Applied)
    }

    async fn rebuild_assignments(&self) -> Result<u64> {
        let mut g = self.lock();
        let mut rebuilt: BTreeMap<String, BikeAssignment> = BTreeMap::new();
        for ((bike, uid, start), end) in &g.tables.stays {
            if end.is_some() {
                continue;
            }
            let newer = rebuilt.get(bike).map_or(true, |a| a.since < *start);
            if newer {
                rebuilt.insert(
                    bike.clone(),
                    BikeAssignment {
                        bike_number: bike.clone(),
                        station_uid: *uid,
                        since: *start,
                    },
                );
            }
        }
        let n = rebuilt.len() as u64;
        g.tables.assignments = rebuilt;
        Ok(n)
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let g = self.lock();
        let t = &g.tables;
        Ok(StoreCounts {
            stations: t.stations.len() as i64,
            stays: t.stays.len() as i64,
            open_stays: t.stays.values().filter(|e| e.is_none()).count() as i64,
            movements: t.movements.len() as i64,
            assignments: t.assignments.len() as i64,
        })
    }
}
