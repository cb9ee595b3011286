mod common;

use common::*;
use velo_reconcile::{apply_changes, distance_km, reconcile_snapshot, ReconcileState};
use velo_schemas::{Stay, StayClose};

#[test]
fn scenario_move_closes_stay_opens_stay_and_records_movement() {
    let mut state = ReconcileState::empty();

    let s1 = entry(1, t(0), vec![station(A, &["123"]), station(B, &[])]);
    let c1 = reconcile_snapshot(&state, &s1);
    assert_eq!(c1.opened_stays, vec![Stay::open("123", A, t(0))]);
    apply_changes(&mut state, &c1);

    let s2 = entry(2, t(10), vec![station(A, &[]), station(B, &["123"])]);
    let c2 = reconcile_snapshot(&state, &s2);

    assert_eq!(
        c2.closed_stays,
        vec![StayClose {
            bike_number: "123".to_string(),
            station_uid: A,
            start_time: t(0),
            end_time: t(10),
        }]
    );
    assert_eq!(c2.opened_stays, vec![Stay::open("123", B, t(10))]);
    assert_eq!(c2.movements.len(), 1);

    let mv = &c2.movements[0];
    assert_eq!(mv.bike_number, "123");
    assert_eq!(mv.start_station_uid, A);
    assert_eq!(mv.end_station_uid, B);
    assert_eq!(mv.start_time, t(0));
    assert_eq!(mv.end_time, t(10));

    let expected = distance_km(A_LAT, A_LNG, B_LAT, B_LNG);
    assert!((mv.distance_km - expected).abs() < 1e-6);

    assert_eq!(c2.assignments.len(), 1);
    assert_eq!(c2.assignments[0].station_uid, B);
    assert_eq!(c2.assignments[0].since, t(10));
    assert!(c2.anomalies.is_clean());
    assert_eq!(c2.anomalies.unlocated_bikes, 0);
}

#[test]
fn scenario_second_move_starts_at_previous_arrival() {
    let mut state = ReconcileState::empty();
    for e in [
        entry(1, t(0), vec![station(A, &["5"])]),
        entry(2, t(10), vec![station(B, &["5"])]),
    ] {
        let c = reconcile_snapshot(&state, &e);
        apply_changes(&mut state, &c);
    }

    let back = entry(3, t(30), vec![station(A, &["5"]), station(B, &[])]);
    let c = reconcile_snapshot(&state, &back);

    assert_eq!(c.movements.len(), 1);
    assert_eq!(c.movements[0].start_station_uid, B);
    assert_eq!(c.movements[0].end_station_uid, A);
    assert_eq!(c.movements[0].start_time, t(10));
    assert_eq!(c.movements[0].end_time, t(30));
}
