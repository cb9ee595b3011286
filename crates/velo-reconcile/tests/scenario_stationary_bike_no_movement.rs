mod common;

use common::*;
use velo_reconcile::{apply_changes, reconcile_snapshot, ReconcileState};

#[test]
fn scenario_same_station_in_consecutive_snapshots_changes_nothing() {
    let mut state = ReconcileState::empty();

    let s1 = entry(1, t(0), vec![station(A, &["123"])]);
    let c1 = reconcile_snapshot(&state, &s1);
    apply_changes(&mut state, &c1);
    let before = state.clone();

    let s2 = entry(2, t(5), vec![station(A, &["123"])]);
    let c2 = reconcile_snapshot(&state, &s2);

    assert!(c2.is_noop(), "stationary bike must not produce writes: {c2:?}");
    assert!(c2.movements.is_empty());

    apply_changes(&mut state, &c2);
    assert_eq!(
        state.assignment("123"),
        before.assignment("123"),
        "assignment (and therefore open stay start) unchanged"
    );
}
