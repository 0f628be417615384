// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
//! Coordinator behaviour seen through the session API.

use std::future::Future;
use std::time::Duration;

use rete_core::store::Database;
use rete_core::{InvalidationReason, ReteError, Timestamp, Value};
use rete_dry_tests::{
    ages, init_tracing, people, seed_people, set_age, sorted_values, InMemoryConfigStore, Recorder,
    AGE, PERSON, TYPE,
};
use rete_session::{ConfigService, Progress, Session, SessionConfig, SessionError};

const PATIENCE: Duration = Duration::from_secs(5);

fn start(db: &Database, config: SessionConfig) -> Session {
    init_tracing();
    Session::start(db.clone(), config)
}

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(PATIENCE, fut).await.expect("timed out")
}

#[tokio::test]
async fn replay_then_one_set_per_change() {
    let db = Database::new();
    let alice = seed_people(&db, &[("alice", 30)])[0];
    let session = start(&db, SessionConfig::default().labeled("replay"));

    let mut subscription = session.subscribe(&ages()).await.unwrap();
    let replay = within(subscription.next()).await.unwrap();
    assert_eq!(sorted_values(&replay), (vec![Value::Int(30)], vec![]));

    let change = set_age(&db, alice, 31);
    let delta = within(subscription.next()).await.unwrap();
    assert_eq!(sorted_values(&delta), (vec![Value::Int(31)], vec![Value::Int(30)]));

    let reached = within(session.wait_until(change.after_timestamp())).await.unwrap();
    assert_eq!(reached, Timestamp(2));
    assert!(subscription.try_next().is_none());
}

#[tokio::test]
async fn queued_changes_are_coalesced() {
    let db = Database::new();
    let alice = seed_people(&db, &[("alice", 30)])[0];
    let session = start(&db, SessionConfig::default().labeled("coalesce"));
    let mut subscription = session.subscribe(&ages()).await.unwrap();
    within(subscription.next()).await.unwrap();

    // No await in between: all three commits are queued before the
    // coordinator runs again.
    set_age(&db, alice, 31);
    set_age(&db, alice, 32);
    let last = set_age(&db, alice, 33);

    let delta = within(subscription.next()).await.unwrap();
    assert_eq!(sorted_values(&delta), (vec![Value::Int(33)], vec![Value::Int(30)]));
    within(session.wait_until(last.after_timestamp())).await.unwrap();
    assert!(subscription.try_next().is_none());
}

#[tokio::test]
async fn coalescing_can_be_disabled() {
    let db = Database::new();
    let alice = seed_people(&db, &[("alice", 30)])[0];
    let mut config = SessionConfig::default().labeled("no-coalesce");
    config.max_coalesce = 1;
    let session = start(&db, config);
    let recorder = Recorder::new();
    let _observer = session
        .observe_with(&ages(), db.timestamp(), Vec::new(), recorder.sink())
        .await
        .unwrap();

    set_age(&db, alice, 31);
    set_age(&db, alice, 32);
    let last = set_age(&db, alice, 33);
    within(session.wait_until(last.after_timestamp())).await.unwrap();

    assert_eq!(recorder.deliveries(), 4);
    assert_eq!(recorder.live_values(), vec![Value::Int(33)]);
    assert!(recorder.violations().is_empty());
}

#[tokio::test]
async fn observer_waits_for_its_start_timestamp() {
    let db = Database::new();
    let alice = seed_people(&db, &[("alice", 30)])[0];
    let session = start(&db, SessionConfig::default().labeled("deferred"));

    let pending = tokio::spawn({
        let session = session.clone();
        async move { session.observe(&ages(), Timestamp(3), Vec::new()).await }
    });
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    assert!(!pending.is_finished());

    set_age(&db, alice, 31);
    set_age(&db, alice, 32);
    let mut subscription = within(pending).await.unwrap().unwrap();
    let replay = within(subscription.next()).await.unwrap();
    assert_eq!(sorted_values(&replay), (vec![Value::Int(32)], vec![]));
}

#[tokio::test]
async fn dropping_the_last_subscription_disposes_matches() {
    let db = Database::new();
    seed_people(&db, &[("alice", 30)]);
    let session = start(&db, SessionConfig::default().labeled("dispose"));

    let mut subscription = session.subscribe(&ages()).await.unwrap();
    let replay = within(subscription.next()).await.unwrap();
    let age = replay.asserted[0].clone();
    assert!(age.is_valid());

    drop(subscription);
    let reason = within(age.handle().invalidated()).await;
    assert_eq!(reason, InvalidationReason::Disposed { match_id: age.id() });
}

#[tokio::test]
async fn shared_producer_survives_one_unsubscribe() {
    let db = Database::new();
    let alice = seed_people(&db, &[("alice", 30)])[0];
    let session = start(&db, SessionConfig::default().labeled("shared"));
    let query = ages();

    let mut first = session.subscribe(&query).await.unwrap();
    let mut second = session.subscribe(&query).await.unwrap();
    let a = within(first.next()).await.unwrap();
    let b = within(second.next()).await.unwrap();
    assert_eq!(a.asserted[0].id(), b.asserted[0].id());

    drop(first);
    set_age(&db, alice, 31);
    let delta = within(second.next()).await.unwrap();
    assert_eq!(delta.retracted[0].id(), a.asserted[0].id());
    assert!(delta.asserted[0].is_valid());
}

#[tokio::test]
async fn observer_is_removed_when_a_dependency_is_invalidated() {
    let db = Database::new();
    let alice = seed_people(&db, &[("alice", 30)])[0];
    let session = start(&db, SessionConfig::default().labeled("dependency"));

    let mut everyone = session.subscribe(&people()).await.unwrap();
    let alice_match = within(everyone.next()).await.unwrap().asserted[0].clone();
    let mut dependent = session
        .observe(&ages(), db.timestamp(), vec![alice_match.handle().clone()])
        .await
        .unwrap();
    within(dependent.next()).await.unwrap();

    db.transact(|tx| {
        tx.retract(alice, TYPE, PERSON);
    });
    let last = within(dependent.next()).await.unwrap();
    assert_eq!(sorted_values(&last), (vec![], vec![Value::Int(30)]));
    assert!(within(dependent.next()).await.is_none());
    assert!(!alice_match.is_valid());
}

#[tokio::test]
async fn invalid_dependency_is_rejected_up_front() {
    let db = Database::new();
    let alice = seed_people(&db, &[("alice", 30)])[0];
    let session = start(&db, SessionConfig::default().labeled("rejected"));

    let mut subscription = session.subscribe(&ages()).await.unwrap();
    let age = within(subscription.next()).await.unwrap().asserted[0].clone();
    set_age(&db, alice, 31);
    within(subscription.next()).await.unwrap();

    let err = session
        .observe(&people(), db.timestamp(), vec![age.handle().clone()])
        .await
        .unwrap_err();
    let SessionError::Unsatisfied(unsatisfied) = err else {
        panic!("expected an unsatisfied match, got {err:?}");
    };
    assert_eq!(unsatisfied.reason().match_id(), Some(age.id()));
    assert_eq!(session.timestamp().unwrap(), Timestamp(2));
}

#[tokio::test]
async fn shutdown_poisons_the_session() {
    let db = Database::new();
    seed_people(&db, &[("alice", 30)]);
    let session = start(&db, SessionConfig::default().labeled("shutdown"));

    let mut subscription = session.subscribe(&ages()).await.unwrap();
    let age = within(subscription.next()).await.unwrap().asserted[0].clone();

    within(session.shutdown()).await;
    assert_eq!(session.progress(), Progress::Poisoned(ReteError::Shutdown));
    assert_eq!(
        session.timestamp().unwrap_err(),
        SessionError::Poisoned(ReteError::Shutdown)
    );
    assert!(within(subscription.next()).await.is_none());
    assert_eq!(
        within(age.handle().invalidated()).await,
        InvalidationReason::Poisoned(ReteError::Shutdown)
    );
    assert_eq!(
        session.subscribe(&ages()).await.unwrap_err(),
        SessionError::Poisoned(ReteError::Shutdown)
    );
}

#[tokio::test]
async fn panicking_closure_poisons_the_session() {
    let db = Database::new();
    let alice = seed_people(&db, &[("alice", 30)])[0];
    let session = start(&db, SessionConfig::default().labeled("panic"));
    let fragile = people().map(|db, person| {
        let age = db.value(*person, AGE);
        if age == Some(Value::Int(99)) {
            panic!("boom");
        }
        age
    });

    let mut subscription = session.subscribe(&fragile).await.unwrap();
    within(subscription.next()).await.unwrap();

    let change = set_age(&db, alice, 99);
    assert!(within(subscription.next()).await.is_none());
    let err = within(session.wait_until(change.after_timestamp())).await.unwrap_err();
    assert_eq!(err, SessionError::Poisoned(ReteError::Panicked("boom".into())));
    assert_eq!(session.closed_error(), err);
}

#[tokio::test]
async fn config_round_trips_through_a_store() {
    let store = InMemoryConfigStore::new();
    let service = ConfigService::new(store.clone());
    SessionConfig::default()
        .labeled("stored")
        .with_strict(false)
        .save(&service)
        .unwrap();

    let config = SessionConfig::load(&service).unwrap();
    let session = start(&Database::new(), config);
    assert_eq!(session.config().label, "stored");
    assert_eq!(store.save_count(), 1);
    assert_eq!(store.load_count(), 1);
    assert_eq!(session.timestamp().unwrap(), Timestamp::ZERO);
}
