use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use velo_schemas::{
    BikeAssignment, Movement, SequenceId, StationInfo, StationUid, Stay, StayClose,
};

// ---------------------------------------------------------------------------
// Input state
// ---------------------------------------------------------------------------

/// Cumulative state the diff engine compares each snapshot against.
///
/// Mirrors the durable `bike_assignment` and `stations` tables. A bike with no
/// entry in `assignments` has never been seen.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconcileState {
    pub assignments: BTreeMap<String, BikeAssignment>,
    pub stations: BTreeMap<StationUid, StationInfo>,
}

impl ReconcileState {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_rows(assignments: Vec<BikeAssignment>, stations: Vec<StationInfo>) -> Self {
        Self {
            assignments: assignments
                .into_iter()
                .map(|a| (a.bike_number.clone(), a))
                .collect(),
            stations: stations.into_iter().map(|s| (s.uid, s)).collect(),
        }
    }

    pub fn assignment(&self, bike_number: &str) -> Option<&BikeAssignment> {
        self.assignments.get(bike_number)
    }

    /// Bikes currently assigned to `station_uid`.
    /// Assigned bikes grouped by station, built in one pass.
    pub fn bikes_by_station(&self) -> BTreeMap<StationUid, BTreeSet<&str>> {
        let mut out: BTreeMap<StationUid, BTreeSet<&str>> = BTreeMap::new();
        for a in self.assignments.values() {
            out.entry(a.station_uid)
                .or_default()
                .insert(a.bike_number.as_str());
        }
        out
    }

    pub fn bikes_at(&self, station_uid: StationUid) -> BTreeSet<&str> {
        self.assignments
            .values()
            .filter(|a| a.station_uid == station_uid)
            .map(|a| a.bike_number.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Anomalies
// ---------------------------------------------------------------------------

/// Inconsistencies in feed data. Counted and logged; never fatal.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// The same bike was listed at more than one station in one snapshot.
    DuplicatePlacement {
        bike_number: String,
        kept_station_uid: StationUid,
        dropped_station_uid: StationUid,
    },
    /// A movement endpoint had no known coordinates; distance recorded as 0.
    MissingCoordinates {
        bike_number: String,
        station_uid: StationUid,
    },
    /// The snapshot is not newer than the bike's current stay; bike left untouched.
    NonMonotonicTime {
        bike_number: String,
        since: DateTime<Utc>,
        polled_at: DateTime<Utc>,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub anomalies: Vec<Anomaly>,
    /// Bikes that left a station in this snapshot without showing up anywhere else.
    pub unlocated_bikes: u64,
}

impl AnomalyReport {
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
    }

    pub fn duplicate_placements(&self) -> usize {
        self.anomalies
            .iter()
            .filter(|a| matches!(a, Anomaly::DuplicatePlacement { .. }))
            .count()
    }

    pub fn missing_coordinates(&self) -> usize {
        self.anomalies
            .iter()
            .filter(|a| matches!(a, Anomaly::MissingCoordinates { .. }))
            .count()
    }

    pub fn non_monotonic(&self) -> usize {
        self.anomalies
            .iter()
            .filter(|a| matches!(a, Anomaly::NonMonotonicTime { .. }))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Everything one snapshot changes, to be written as a single transaction
/// together with the consumer checkpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotChanges {
    pub sequence_id: SequenceId,
    pub polled_at: DateTime<Utc>,
    /// Station metadata seen in the snapshot (upserted).
    pub stations: Vec<StationInfo>,
    pub closed_stays: Vec<StayClose>,
    pub opened_stays: Vec<Stay>,
    pub movements: Vec<Movement>,
    pub assignments: Vec<BikeAssignment>,
    pub anomalies: AnomalyReport,
}

impl SnapshotChanges {
    pub fn empty(sequence_id: SequenceId, polled_at: DateTime<Utc>) -> Self {
        Self {
            sequence_id,
            polled_at,
            stations: Vec::new(),
            closed_stays: Vec::new(),
            opened_stays: Vec::new(),
            movements: Vec::new(),
            assignments: Vec::new(),
            anomalies: AnomalyReport::default(),
        }
    }

    /// `true` when the snapshot does not alter any stay, movement or assignment.
    /// Station metadata refreshes do not count.
    pub fn is_noop(&self) -> bool {
        self.closed_stays.is_empty()
            && self.opened_stays.is_empty()
            && self.movements.is_empty()
            && self.assignments.is_empty()
    }
}
