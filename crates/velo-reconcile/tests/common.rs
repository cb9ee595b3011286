#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use velo_schemas::{LogEntry, Snapshot, StationSample, StationUid};

pub const A: StationUid = 100;
pub const B: StationUid = 200;

pub const A_LAT: f64 = 51.0504;
pub const A_LNG: f64 = 13.7373;
pub const B_LAT: f64 = 51.0290;
pub const B_LNG: f64 = 13.7270;

pub fn t(min: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap() + Duration::minutes(min)
}

pub fn station(uid: StationUid, bikes: &[&str]) -> StationSample {
    let (lat, lng) = match uid {
        A => (A_LAT, A_LNG),
        B => (B_LAT, B_LNG),
        other => (51.0 + other as f64 / 10_000.0, 13.7),
    };
    StationSample {
        uid,
        name: format!("station-{uid}"),
        lat,
        lng,
        bikes_present: bikes.iter().map(|b| b.to_string()).collect(),
    }
}

pub fn entry(seq: i64, at: DateTime<Utc>, stations: Vec<StationSample>) -> LogEntry {
    LogEntry {
        sequence_id: seq,
        snapshot: Snapshot::new(at, stations),
    }
}
