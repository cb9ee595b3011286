//! Shared data model for the bike tracking pipeline.
//!
//! Everything that crosses a crate boundary lives here: the polled
//! [`Snapshot`], the sequenced [`LogEntry`] written to the snapshot log, and
//! the rows the reconciler owns ([`Stay`], [`Movement`], [`BikeAssignment`],
//! [`Checkpoint`], [`StationInfo`]).
//!
//! No IO and no logic beyond small constructors and accessors.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Station identifier as reported by the upstream feed.
pub type StationUid = i64;

/// Position in the snapshot log. Assigned by the log, strictly increasing.
pub type SequenceId = i64;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One docking station as observed in a single poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationSample {
    pub uid: StationUid,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    /// Bike numbers docked at the station when the feed was sampled.
    #[serde(rename = "bikes", default)]
    pub bikes_present: BTreeSet<String>,
}

impl StationSample {
    pub fn info(&self) -> StationInfo {
        StationInfo {
            uid: self.uid,
            name: self.name.clone(),
            lat: self.lat,
            lng: self.lng,
        }
    }
}

/// One timestamped sample of every station's occupancy.
///
/// Produced by the poller; the log assigns the sequence id on append and the
/// snapshot is immutable from then on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub polled_at: DateTime<Utc>,
    pub stations: Vec<StationSample>,
}

impl Snapshot {
    pub fn new(polled_at: DateTime<Utc>, stations: Vec<StationSample>) -> Self {
        Self {
            polled_at,
            stations,
        }
    }

    /// Total number of bike placements (a bike listed twice counts twice).
    pub fn bike_count(&self) -> usize {
        self.stations.iter().map(|s| s.bikes_present.len()).sum()
    }
}

/// A snapshot together with the sequence id the log assigned to it.
///
/// Serializes to the log entry wire format:
/// `{sequence_id, polled_at, stations: [{uid, name, lat, lng, bikes}]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence_id: SequenceId,
    #[serde(flatten)]
    pub snapshot: Snapshot,
}

impl LogEntry {
    pub fn polled_at(&self) -> DateTime<Utc> {
        self.snapshot.polled_at
    }
}

// ---------------------------------------------------------------------------
// Reconciler-owned rows
// ---------------------------------------------------------------------------

/// Static station metadata, refreshed from every processed snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationInfo {
    pub uid: StationUid,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
}

/// Current location of a tracked bike.
///
/// `since` is the start time of the bike's open stay at `station_uid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BikeAssignment {
    pub bike_number: String,
    pub station_uid: StationUid,
    pub since: DateTime<Utc>,
}

/// A continuous interval during which a bike was recorded at one station.
///
/// Keyed by `(bike_number, station_uid, start_time)`. `end_time == None`
/// marks the open stay; a bike has at most one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stay {
    pub bike_number: String,
    pub station_uid: StationUid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Stay {
    pub fn open(
        bike_number: impl Into<String>,
        station_uid: StationUid,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            bike_number: bike_number.into(),
            station_uid,
            start_time,
            end_time: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Instruction to close the open stay identified by
/// `(bike_number, station_uid, start_time)` at `end_time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StayClose {
    pub bike_number: String,
    pub station_uid: StationUid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// A detected transition of a bike between two stations.
///
/// Uniquely identified by `(bike_number, start_time)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    pub bike_number: String,
    pub start_station_uid: StationUid,
    pub end_station_uid: StationUid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub distance_km: f64,
}

impl Movement {
    /// Idempotency key used to absorb replays.
    pub fn key(&self) -> (String, DateTime<Utc>) {
        (self.bike_number.clone(), self.start_time)
    }
}

/// Last log position durably processed by a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub consumer_id: String,
    pub last_committed_sequence_id: SequenceId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn log_entry_serializes_to_flat_wire_format() {
        let polled_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let entry = LogEntry {
            sequence_id: 7,
            snapshot: Snapshot::new(
                polled_at,
                vec![StationSample {
                    uid: 42,
                    name: "Hauptbahnhof".to_string(),
                    lat: 51.0,
                    lng: 13.7,
                    bikes_present: ["930".to_string(), "123".to_string()].into_iter().collect(),
                }],
            ),
        };

        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["sequence_id"], 7);
        assert!(v.get("snapshot").is_none(), "snapshot must be flattened");
        assert_eq!(v["stations"][0]["uid"], 42);
        // BTreeSet keeps the bike list sorted on the wire.
        assert_eq!(v["stations"][0]["bikes"][0], "123");
        assert_eq!(v["stations"][0]["bikes"][1], "930");

        let back: LogEntry = serde_json::from_value(v).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn station_without_bikes_field_decodes_empty() {
        let s: StationSample =
            serde_json::from_str(r#"{"uid":1,"name":"A","lat":1.0,"lng":2.0}"#).unwrap();
        assert!(s.bikes_present.is_empty());
    }

    #[test]
    fn snapshot_bike_count_sums_stations() {
        let now = Utc::now();
        let snap = Snapshot::new(
            now,
            vec![
                StationSample {
                    uid: 1,
                    name: "A".into(),
                    lat: 0.0,
                    lng: 0.0,
                    bikes_present: ["1".to_string(), "2".to_string()].into_iter().collect(),
                },
                StationSample {
                    uid: 2,
                    name: "B".into(),
                    lat: 0.0,
                    lng: 0.0,
                    bikes_present: ["2".to_string()].into_iter().collect(),
                },
            ],
        );
        assert_eq!(snap.bike_count(), 3);
    }
}
