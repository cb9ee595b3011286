mod common;

use common::*;
use velo_reconcile::{reconcile_snapshot, Anomaly, ReconcileState};

#[test]
fn scenario_bike_at_two_stations_is_placed_at_lowest_uid() {
    let state = ReconcileState::empty();
    // Listed high uid first to prove feed order does not matter.
    let e = entry(1, t(0), vec![station(B, &["42"]), station(A, &["42"])]);

    let c = reconcile_snapshot(&state, &e);

    assert_eq!(c.opened_stays.len(), 1);
    assert_eq!(c.opened_stays[0].station_uid, A);
    assert_eq!(c.assignments[0].station_uid, A);
    assert_eq!(
        c.anomalies.anomalies,
        vec![Anomaly::DuplicatePlacement {
            bike_number: "42".to_string(),
            kept_station_uid: A,
            dropped_station_uid: B,
        }]
    );
}

#[test]
fn scenario_duplicate_does_not_move_bike_already_at_lowest_uid() {
    let state = velo_reconcile::ReconcileState::from_rows(
        vec![velo_schemas::BikeAssignment {
            bike_number: "42".to_string(),
            station_uid: A,
            since: t(0),
        }],
        vec![],
    );
    let e = entry(2, t(5), vec![station(A, &["42"]), station(B, &["42"])]);

    let c = reconcile_snapshot(&state, &e);
    assert!(c.is_noop());
    assert_eq!(c.anomalies.duplicate_placements(), 1);
}
