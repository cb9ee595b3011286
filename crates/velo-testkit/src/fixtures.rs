use chrono::{DateTime, Duration, TimeZone, Utc};
use velo_feed::{RawBike, RawCity, RawCountry, RawFeed, RawPlace};
use velo_schemas::{LogEntry, Snapshot, StationSample, StationUid};

pub const STATION_A: StationUid = 100;
pub const STATION_B: StationUid = 200;
pub const STATION_C: StationUid = 300;

/// Fixed coordinates for the fixture stations (central Dresden).
pub fn coords(uid: StationUid) -> (f64, f64) {
    match uid {
        STATION_A => (51.0504, 13.7373),
        STATION_B => (51.0290, 13.7270),
        STATION_C => (51.0657, 13.7522),
        other => (51.0 + (other % 1_000) as f64 / 10_000.0, 13.7),
    }
}

/// Fixture clock: 2024-06-01 08:00 UTC plus `minutes`.
pub fn t(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
        + Duration::minutes(minutes)
}

pub fn station(uid: StationUid, bikes: &[&str]) -> StationSample {
    let (lat, lng) = coords(uid);
    StationSample {
        uid,
        name: format!("Station {uid}"),
        lat,
        lng,
        bikes_present: bikes.iter().map(|b| b.to_string()).collect(),
    }
}

pub fn snapshot(at: DateTime<Utc>, stations: Vec<StationSample>) -> Snapshot {
    Snapshot::new(at, stations)
}

pub fn entry(sequence_id: i64, at: DateTime<Utc>, stations: Vec<StationSample>) -> LogEntry {
    LogEntry {
        sequence_id,
        snapshot: snapshot(at, stations),
    }
}

/// Raw feed document with one docking station per `(uid, bikes)` pair.
pub fn raw_feed(stations: &[(StationUid, &[&str])]) -> RawFeed {
    let places = stations
        .iter()
        .map(|(uid, bikes)| {
            let (lat, lng) = coords(*uid);
            RawPlace {
                uid: *uid,
                lat,
                lng,
                name: format!("Station {uid}"),
                spot: true,
                bike_list: bikes
                    .iter()
                    .map(|b| RawBike {
                        number: b.to_string(),
                    })
                    .collect(),
            }
        })
        .collect();

    RawFeed {
        countries: vec![RawCountry {
            cities: vec![RawCity { places }],
        }],
    }
}
