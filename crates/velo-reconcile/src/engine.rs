use std::collections::{BTreeMap, BTreeSet};

use velo_schemas::{
    BikeAssignment, LogEntry, Movement, StationInfo, StationUid, Stay, StayClose,
};

use crate::geo::distance_km;
use crate::{Anomaly, ReconcileState, SnapshotChanges};

/// Station metadata plus the bikes the snapshot lists there, after merging
/// repeated station uids.
struct MergedStation<'a> {
    info: StationInfo,
    bikes: BTreeSet<&'a str>,
}

fn merge_stations(entry: &LogEntry) -> BTreeMap<StationUid, MergedStation<'_>> {
    let mut out: BTreeMap<StationUid, MergedStation<'_>> = BTreeMap::new();
    for st in &entry.snapshot.stations {
        let merged = out.entry(st.uid).or_insert_with(|| MergedStation {
            info: st.info(),
            bikes: BTreeSet::new(),
        });
        merged
            .bikes
            .extend(st.bikes_present.iter().map(String::as_str));
    }
    out
}

fn coords(
    merged: &BTreeMap<StationUid, MergedStation<'_>>,
    state: &ReconcileState,
    uid: StationUid,
) -> Option<(f64, f64)> {
    merged
        .get(&uid)
        .map(|m| (m.info.lat, m.info.lng))
        .or_else(|| state.stations.get(&uid).map(|s| (s.lat, s.lng)))
}

/// Diff one log entry against the cumulative state.
///
/// Per station: `arrived = present - assigned`. An arrived bike that is
/// assigned elsewhere closes that stay and produces a movement; every arrived
/// bike opens a stay at its new station. Bikes that departed without arriving
/// anywhere keep their open stay and assignment.
///
/// Replaying an entry that has already been applied yields no stay, movement
/// or assignment changes, because every listed bike is already assigned to
/// the station listing it.
pub fn reconcile_snapshot(state: &ReconcileState, entry: &LogEntry) -> SnapshotChanges {
    let polled_at = entry.polled_at();
    let mut changes = SnapshotChanges::empty(entry.sequence_id, polled_at);
    let merged = merge_stations(entry);

    // 1) Placement. BTreeMap iteration is ascending by uid, so the first
    //    station to claim a bike is the lowest uid.
    let mut placement: BTreeMap<&str, StationUid> = BTreeMap::new();
    let mut present: BTreeMap<StationUid, BTreeSet<&str>> = BTreeMap::new();
    for (&uid, station) in &merged {
        let slot = present.entry(uid).or_default();
        for &bike in &station.bikes {
            match placement.get(bike) {
                Some(&kept) => changes.anomalies.anomalies.push(Anomaly::DuplicatePlacement {
                    bike_number: bike.to_string(),
                    kept_station_uid: kept,
                    dropped_station_uid: uid,
                }),
                None => {
                    placement.insert(bike, uid);
                    slot.insert(bike);
                }
            }
        }
    }

    changes.stations = merged.values().map(|m| m.info.clone()).collect();

    // 2) Arrivals.
    let assigned_by_station = state.bikes_by_station();
    let nobody: BTreeSet<&str> = BTreeSet::new();
    for (&uid, bikes) in &present {
        let assigned = assigned_by_station.get(&uid).unwrap_or(&nobody);

        for &bike in bikes.difference(assigned) {
            if let Some(prev) = state.assignment(bike) {
                if polled_at <= prev.since {
                    changes.anomalies.anomalies.push(Anomaly::NonMonotonicTime {
                        bike_number: bike.to_string(),
                        since: prev.since,
                        polled_at,
                    });
                    continue;
                }

                let distance = match (
                    coords(&merged, state, prev.station_uid),
                    coords(&merged, state, uid),
                ) {
                    (Some((lat1, lng1)), Some((lat2, lng2))) => distance_km(lat1, lng1, lat2, lng2),
                    (from, _) => {
                        let missing = if from.is_none() { prev.station_uid } else { uid };
                        changes.anomalies.anomalies.push(Anomaly::MissingCoordinates {
                            bike_number: bike.to_string(),
                            station_uid: missing,
                        });
                        0.0
                    }
                };

                changes.closed_stays.push(StayClose {
                    bike_number: bike.to_string(),
                    station_uid: prev.station_uid,
                    start_time: prev.since,
                    end_time: polled_at,
                });
                changes.movements.push(Movement {
                    bike_number: bike.to_string(),
                    start_station_uid: prev.station_uid,
                    end_station_uid: uid,
                    start_time: prev.since,
                    end_time: polled_at,
                    distance_km: distance,
                });
            }

            changes.opened_stays.push(Stay::open(bike, uid, polled_at));
            changes.assignments.push(BikeAssignment {
                bike_number: bike.to_string(),
                station_uid: uid,
                since: polled_at,
            });
        }
    }

    // 3) Tracked bikes listed nowhere keep their open stay (unlocated),
    //    including bikes whose station dropped out of the feed.
    changes.anomalies.unlocated_bikes = state
        .assignments
        .keys()
        .filter(|bike| !placement.contains_key(bike.as_str()))
        .count() as u64;

    changes.anomalies.anomalies.sort();
    changes
}

/// Advance an in-memory state by changes that have been durably applied.
pub fn apply_changes(state: &mut ReconcileState, changes: &SnapshotChanges) {
    for st in &changes.stations {
        state.stations.insert(st.uid, st.clone());
    }
    for a in &changes.assignments {
        state.assignments.insert(a.bike_number.clone(), a.clone());
    }
}
