// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
//! Failures poison the whole network.

use std::sync::Arc;

use rete_core::store::Database;
use rete_core::{InvalidationReason, Network, ObserveError, ReteError, Timestamp, Value};
use rete_dry_tests::{ages, people, seed_people, set_age, Recorder, AGE};

#[test]
fn panicking_closure_poisons_and_invalidates_everything() {
    let db = Database::new();
    let alice = seed_people(&db, &[("alice", 30)])[0];
    let mut net = Network::new(db.latest());
    let healthy = Recorder::new();
    net.add_observer(&ages(), Vec::new(), healthy.sink()).unwrap();
    let age = healthy.live_matches()[0].clone();
    let fragile = people().filter(|db, person| {
        if db.value(*person, AGE) == Some(Value::Int(99)) {
            panic!("boom");
        }
        true
    });
    net.add_observer(&fragile, Vec::new(), Recorder::new().sink()).unwrap();

    let err = net.apply_change(&set_age(&db, alice, 99)).unwrap_err();
    let cause = ReteError::Panicked(Arc::from("boom"));
    assert_eq!(err, cause);
    assert_eq!(net.poisoned(), Some(&cause));
    assert_eq!(net.producer_count(), 0);
    assert_eq!(net.observer_count(), 0);
    assert_eq!(
        age.handle().invalidation(),
        Some(InvalidationReason::Poisoned(cause.clone()))
    );

    assert_eq!(net.apply_change(&set_age(&db, alice, 31)).unwrap_err(), cause);
    assert_eq!(
        net.add_observer(&ages(), Vec::new(), Recorder::new().sink())
            .unwrap_err(),
        ObserveError::Rete(cause)
    );
}

#[test]
#[should_panic(expected = "boom")]
fn strict_network_lets_panics_through() {
    let db = Database::new();
    seed_people(&db, &[("alice", 30)]);
    let mut net = Network::new(db.latest()).with_strict(true);
    assert!(net.is_strict());
    let fragile = people().map(|_, _| -> u8 { panic!("boom") });
    let _ = net.add_observer(&fragile, Vec::new(), Recorder::new().sink());
}

#[test]
fn second_match_in_a_single_query_poisons() {
    let db = Database::new();
    seed_people(&db, &[("alice", 30)]);
    let mut net = Network::new(db.latest());
    let only = Recorder::new();
    net.add_observer(&people().single(), Vec::new(), only.sink()).unwrap();
    assert_eq!(only.live_matches().len(), 1);

    let hired = db.transact(|tx| {
        rete_dry_tests::add_person(tx, "bob", 40);
    });
    let err = net.apply_change(&hired).unwrap_err();
    assert!(matches!(err, ReteError::MultipleMatches { count: 2, .. }));
    assert!(net.poisoned().is_some());
}

#[test]
fn gap_in_the_change_stream_poisons() {
    let db = Database::new();
    let alice = seed_people(&db, &[("alice", 30)])[0];
    let mut net = Network::new(db.latest());
    let skipped = set_age(&db, alice, 31);
    let next = set_age(&db, alice, 32);

    assert_eq!(
        net.apply_change(&next).unwrap_err(),
        ReteError::NonContiguousChange {
            expected: Timestamp(1),
            found: Timestamp(2),
        }
    );
    // Stale changes are ignored, but the network is already poisoned.
    assert!(net.apply_change(&skipped).is_err());
    assert!(net.poisoned().is_some());
}

#[test]
fn stale_change_is_ignored() {
    let db = Database::new();
    let alice = seed_people(&db, &[("alice", 30)])[0];
    let change = set_age(&db, alice, 31);
    let mut net = Network::new(db.latest());
    let recorder = Recorder::new();
    net.add_observer(&ages(), Vec::new(), recorder.sink()).unwrap();

    net.apply_change(&change).unwrap();
    assert_eq!(recorder.deliveries(), 1);
    assert!(net.poisoned().is_none());
    assert_eq!(net.timestamp(), Timestamp(2));
}
