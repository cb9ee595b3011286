//! Raw feed -> [`Snapshot`] normalization.
//!
//! Rules:
//! - places with `spot = false` are skipped unless free-floating bikes are
//!   explicitly included
//! - places with non-finite or out-of-range coordinates are rejected
//! - blank bike numbers are dropped; numbers are trimmed
//! - repeated station uids are merged (union of bikes)
//! - output stations are sorted by uid
//!
//! A payload with no usable station at all is a malformed feed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use velo_schemas::{Snapshot, StationSample};

use crate::provider::RawFeed;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeOptions {
    pub include_free_floating: bool,
}

/// Per-poll counts of what normalization kept and discarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedQualityReport {
    pub places_read: u64,
    pub stations_ok: u64,
    pub bikes_ok: u64,
    pub skipped_free_floating: u64,
    pub rejected_bad_coordinates: u64,
    pub dropped_blank_bike_numbers: u64,
    pub merged_duplicate_uids: u64,
    /// Bikes listed at more than one station. Kept as-is; the reconciler
    /// applies the tie-break.
    pub bikes_at_multiple_stations: u64,
}

impl FeedQualityReport {
    pub fn has_rejections(&self) -> bool {
        self.rejected_bad_coordinates > 0
            || self.dropped_blank_bike_numbers > 0
            || self.merged_duplicate_uids > 0
            || self.bikes_at_multiple_stations > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    /// Nothing usable in the payload.
    NoStations { report: FeedQualityReport },
}

impl fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormalizeError::NoStations { report } => write!(
                f,
                "feed contained no usable stations (places_read={} skipped_free_floating={} rejected_bad_coordinates={})",
                report.places_read, report.skipped_free_floating, report.rejected_bad_coordinates
            ),
        }
    }
}

impl std::error::Error for NormalizeError {}

fn coordinates_valid(lat: f64, lng: f64) -> bool {
    lat.is_finite() && lng.is_finite() && lat.abs() <= 90.0 && lng.abs() <= 180.0
}

pub fn normalize(
    raw: &RawFeed,
    polled_at: DateTime<Utc>,
    opts: NormalizeOptions,
) -> Result<(Snapshot, FeedQualityReport), NormalizeError> {
    let mut report = FeedQualityReport::default();
    let mut by_uid: BTreeMap<i64, StationSample> = BTreeMap::new();

    for place in raw.places() {
        report.places_read += 1;

        if !place.spot && !opts.include_free_floating {
            report.skipped_free_floating += 1;
            continue;
        }
        if !coordinates_valid(place.lat, place.lng) {
            report.rejected_bad_coordinates += 1;
            continue;
        }

        let mut bikes: BTreeSet<String> = BTreeSet::new();
        for b in &place.bike_list {
            let n = b.number.trim();
            if n.is_empty() {
                report.dropped_blank_bike_numbers += 1;
            } else {
                bikes.insert(n.to_string());
            }
        }

        match by_uid.get_mut(&place.uid) {
            Some(existing) => {
                report.merged_duplicate_uids += 1;
                existing.bikes_present.extend(bikes);
            }
            None => {
                by_uid.insert(
                    place.uid,
                    StationSample {
                        uid: place.uid,
                        name: place.name.trim().to_string(),
                        lat: place.lat,
                        lng: place.lng,
                        bikes_present: bikes,
                    },
                );
            }
        }
    }

    if by_uid.is_empty() {
        return Err(NormalizeError::NoStations { report });
    }

    let mut seen: BTreeMap<&str, u32> = BTreeMap::new();
    for st in by_uid.values() {
        for b in &st.bikes_present {
            *seen.entry(b.as_str()).or_default() += 1;
        }
    }
    report.bikes_at_multiple_stations = seen.values().filter(|&&n| n > 1).count() as u64;

    let stations: Vec<StationSample> = by_uid.into_values().collect();
    report.stations_ok = stations.len() as u64;
    report.bikes_ok = stations.iter().map(|s| s.bikes_present.len() as u64).sum();

    Ok((Snapshot::new(polled_at, stations), report))
}

/// SHA-256 over the station occupancy of a snapshot, ignoring `polled_at`.
///
/// Two snapshots with equal fingerprints list the same bikes at the same
/// stations.
pub fn occupancy_fingerprint(snapshot: &Snapshot) -> String {
    let mut hasher = Sha256::new();
    for st in &snapshot.stations {
        hasher.update(st.uid.to_be_bytes());
        for b in &st.bikes_present {
            hasher.update(b.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([0xffu8]);
    }
    hex::encode(hasher.finalize())
}
