// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]
//! Transactional interceptor: validate, reject, spin.

use std::future::Future;
use std::time::Duration;

use rete_core::store::Database;
use rete_core::{DbView, InvalidationReason, Match, ReteError, Timestamp, UnsatisfiedMatch, Value};
use rete_dry_tests::{
    add_person, age_ints, ages, init_tracing, people, seed_people, set_age, sorted_values, AGE, NAME,
};
use rete_session::{MatchScope, Session, SessionConfig, SessionError, Subscription, WithMatchResult};

const PATIENCE: Duration = Duration::from_secs(5);

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(PATIENCE, fut).await.expect("timed out")
}

/// A session over alice (30) and bob (40) plus a scope pinned to alice's age.
struct Fixture {
    db: Database,
    alice: rete_core::EntityId,
    bob: rete_core::EntityId,
    pinned: MatchScope,
    alice_age: Match<Value>,
    ages: Subscription<Value>,
}

async fn fixture(label: &str) -> Fixture {
    init_tracing();
    let db = Database::new();
    let ids = seed_people(&db, &[("alice", 30), ("bob", 40)]);
    let session = Session::start(db.clone(), SessionConfig::default().labeled(label));
    let mut subscription = session.subscribe(&ages()).await.unwrap();
    let replay = within(subscription.next()).await.unwrap();
    let alice_age = replay
        .asserted
        .iter()
        .find(|age| *age.value() == Value::Int(30))
        .unwrap()
        .clone();
    let pinned = session.scope().depending_on([alice_age.handle()]);
    Fixture {
        db,
        alice: ids[0],
        bob: ids[1],
        pinned,
        alice_age,
        ages: subscription,
    }
}

#[tokio::test]
async fn unrelated_write_commits_and_is_visible() {
    let mut f = fixture("valid").await;
    let bob = f.bob;

    let committed = within(f.pinned.transact(|tx| {
        tx.set(bob, AGE, 41);
    }))
    .await
    .unwrap();
    assert_eq!(committed.spins, 0);
    assert_eq!(committed.change.after_timestamp(), Timestamp(2));
    // The commit only returns once the coordinator has delivered it.
    assert_eq!(f.pinned.session().timestamp().unwrap(), Timestamp(2));
    let delta = f.ages.try_next().unwrap();
    assert_eq!(sorted_values(&delta), (vec![Value::Int(41)], vec![Value::Int(40)]));
    assert!(f.alice_age.is_valid());
}

#[tokio::test]
async fn write_invalidating_a_context_match_is_refused() {
    let f = fixture("invalid").await;
    let alice = f.alice;

    let err = within(f.pinned.transact(|tx| {
        tx.set(alice, AGE, 31);
    }))
    .await
    .unwrap_err();
    assert_eq!(
        err,
        SessionError::Unsatisfied(UnsatisfiedMatch::new(
            InvalidationReason::Retracted {
                match_id: f.alice_age.id(),
                at: Timestamp(2),
            }
        ))
    );
    assert_eq!(f.db.timestamp(), Timestamp(1));
    assert!(f.alice_age.is_valid());
}

#[tokio::test]
async fn already_invalid_context_reports_its_own_reason() {
    let f = fixture("stale").await;
    let committed = set_age(&f.db, f.alice, 31);
    within(f.pinned.session().wait_until(committed.after_timestamp()))
        .await
        .unwrap();
    let bob = f.bob;

    let err = within(f.pinned.transact(|tx| {
        tx.set(bob, AGE, 41);
    }))
    .await
    .unwrap_err();
    let SessionError::Unsatisfied(unsatisfied) = err else {
        unreachable!("expected an unsatisfied match, got {err:?}");
    };
    assert_eq!(
        unsatisfied.reason(),
        &InvalidationReason::Retracted {
            match_id: f.alice_age.id(),
            at: Timestamp(2),
        }
    );
    assert_eq!(f.db.timestamp(), Timestamp(2));
}

#[tokio::test]
async fn lagging_network_makes_the_transaction_spin() {
    let f = fixture("spin").await;
    let (alice, bob) = (f.alice, f.bob);

    // Committed behind the coordinator's back; the single-threaded runtime
    // does not run it until the transaction below awaits.
    set_age(&f.db, bob, 41);
    let committed = within(f.pinned.transact(|tx| {
        tx.set(bob, AGE, 42);
    }))
    .await
    .unwrap();

    assert_eq!(committed.spins, 1);
    assert_eq!(committed.change.before_timestamp(), Timestamp(2));
    assert_eq!(committed.change.after_timestamp(), Timestamp(3));
    assert!(f.alice_age.is_valid());
    assert_eq!(
        DbView::new(&*f.db.latest()).value(alice, AGE),
        Some(Value::Int(30))
    );
}

#[tokio::test]
async fn empty_transaction_commits_without_waiting() {
    let f = fixture("empty").await;
    let alice = f.alice;

    let committed = within(f.pinned.transact(|tx| {
        tx.set(alice, AGE, 30);
    }))
    .await
    .unwrap();
    assert!(committed.change.novelty.is_empty());
    assert_eq!(f.db.timestamp(), Timestamp(1));
}

#[tokio::test]
async fn poisoned_session_refuses_to_commit() {
    let f = fixture("poisoned").await;
    let bob = f.bob;
    within(f.pinned.session().shutdown()).await;

    let err = within(f.pinned.transact(|tx| {
        tx.set(bob, AGE, 41);
    }))
    .await
    .unwrap_err();
    assert!(matches!(err, SessionError::Poisoned(_)));
    assert_eq!(f.db.timestamp(), Timestamp(1));
}

fn retracted(match_id: rete_core::MatchId, at: u64) -> SessionError {
    SessionError::Unsatisfied(UnsatisfiedMatch::new(InvalidationReason::Retracted {
        match_id,
        at: Timestamp(at),
    }))
}

#[tokio::test]
async fn pinned_count_refuses_a_write_that_changes_it() {
    init_tracing();
    let db = Database::new();
    seed_people(&db, &[("alice", 30), ("bob", 40)]);
    let session = Session::start(db.clone(), SessionConfig::default().labeled("count"));

    let outcome = within(session.scope().with_current_match(&people().count(), |headcount, child| async move {
        let attempt = child
            .transact(|tx| {
                add_person(tx, "carol", 25);
            })
            .await;
        (headcount.id(), attempt)
    }))
    .await;
    let WithMatchResult::Success((headcount, attempt)) = outcome else {
        unreachable!("expected the body to finish, got {outcome:?}");
    };
    assert_eq!(attempt.unwrap_err(), retracted(headcount, 2));
    assert_eq!(db.timestamp(), Timestamp(1));
}

#[tokio::test]
async fn pinned_distinct_value_holds_while_any_supporter_remains() {
    init_tracing();
    let db = Database::new();
    let ids = seed_people(&db, &[("alice", 30), ("bob", 40), ("carol", 30)]);
    let (alice, carol) = (ids[0], ids[2]);
    let session = Session::start(db.clone(), SessionConfig::default().labeled("distinct"));
    let mut subscription = session.subscribe(&ages().distinct()).await.unwrap();
    let replay = within(subscription.next()).await.unwrap();
    let thirty = replay
        .asserted
        .iter()
        .find(|age| *age.value() == Value::Int(30))
        .unwrap()
        .clone();
    let pinned = session.scope().depending_on([thirty.handle()]);

    // Carol still carries 30.
    within(pinned.transact(|tx| {
        tx.set(alice, AGE, 31);
    }))
    .await
    .unwrap();
    assert!(thirty.is_valid());

    let err = within(pinned.transact(|tx| {
        tx.set(carol, AGE, 32);
    }))
    .await
    .unwrap_err();
    assert_eq!(err, retracted(thirty.id(), 3));
    assert_eq!(db.timestamp(), Timestamp(2));
    assert!(thirty.is_valid());
}

#[tokio::test]
async fn pinned_sum_allows_writes_that_keep_its_value() {
    init_tracing();
    let db = Database::new();
    let ids = seed_people(&db, &[("alice", 30), ("bob", 40)]);
    let (alice, bob) = (ids[0], ids[1]);
    let session = Session::start(db.clone(), SessionConfig::default().labeled("sum"));
    let mut subscription = session.subscribe(&age_ints().sum()).await.unwrap();
    let replay = within(subscription.next()).await.unwrap();
    let total = replay.asserted[0].clone();
    assert_eq!(*total.value(), 70);
    let pinned = session.scope().depending_on([total.handle()]);

    within(pinned.transact(|tx| {
        tx.set(alice, AGE, 40).set(bob, AGE, 30);
    }))
    .await
    .unwrap();
    within(pinned.transact(|tx| {
        tx.set(alice, NAME, "alicia");
    }))
    .await
    .unwrap();
    assert!(total.is_valid());

    let err = within(pinned.transact(|tx| {
        tx.set(bob, AGE, 31);
    }))
    .await
    .unwrap_err();
    assert_eq!(err, retracted(total.id(), 4));
    assert_eq!(db.timestamp(), Timestamp(3));
}

#[tokio::test]
async fn pinned_single_refuses_a_second_candidate() {
    init_tracing();
    let db = Database::new();
    seed_people(&db, &[("alice", 30)]);
    let session = Session::start(db.clone(), SessionConfig::default().labeled("single"));

    let outcome = within(session.scope().with_current_match(&people().single(), |only, child| async move {
        let attempt = child
            .transact(|tx| {
                add_person(tx, "bob", 40);
            })
            .await;
        (only, attempt)
    }))
    .await;
    let WithMatchResult::Success((only, attempt)) = outcome else {
        unreachable!("expected the body to finish, got {outcome:?}");
    };
    assert_eq!(attempt.unwrap_err(), retracted(only.id(), 2));
    assert!(only.is_valid());
    assert_eq!(db.timestamp(), Timestamp(1));
}

#[tokio::test]
async fn commit_reports_success_when_delivery_poisons_the_session() {
    init_tracing();
    let db = Database::new();
    let alice = seed_people(&db, &[("alice", 30)])[0];
    let session = Session::start(db.clone(), SessionConfig::default().labeled("late-poison"));
    let fragile = people().filter(|db, person| {
        if db.value(*person, AGE) == Some(Value::Int(99)) {
            panic!("boom");
        }
        true
    });
    let mut subscription = session.subscribe(&fragile).await.unwrap();
    within(subscription.next()).await.unwrap();

    let committed = within(session.scope().transact(|tx| {
        tx.set(alice, AGE, 99);
    }))
    .await
    .unwrap();
    assert_eq!(committed.change.after_timestamp(), Timestamp(2));
    assert_eq!(
        DbView::new(&*db.latest()).value(alice, AGE),
        Some(Value::Int(99))
    );
    assert_eq!(
        session.timestamp().unwrap_err(),
        SessionError::Poisoned(ReteError::Panicked("boom".into()))
    );
}
