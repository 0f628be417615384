// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory fact store.
//!
//! [`Database`] keeps the latest [`MemSnapshot`] behind a mutex and publishes
//! a [`Change`] to every listener on commit. Commits are compare-and-swap on
//! the base timestamp: a transaction prepared against an older snapshot is
//! rejected with [`CommitConflict`] and must be rebuilt.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::change::{Change, ChangeMeta, Novelty};
use crate::ident::{Attribute, EntityId, Timestamp};
use crate::snapshot::{Snapshot, SnapshotRef};
use crate::value::{Datom, Value};

/// Immutable snapshot held by [`Database`].
#[derive(Clone, Debug, Default)]
pub struct MemSnapshot {
    timestamp: Timestamp,
    next_entity: u64,
    eav: BTreeMap<(EntityId, Attribute), BTreeSet<Value>>,
    ave: BTreeMap<(Attribute, Value), BTreeSet<EntityId>>,
}

impl MemSnapshot {
    /// Number of datoms in the snapshot.
    pub fn len(&self) -> usize {
        self.eav.values().map(BTreeSet::len).sum()
    }

    /// Returns true if the snapshot holds no datoms.
    pub fn is_empty(&self) -> bool {
        self.eav.is_empty()
    }

    /// Iterates all datoms in `(entity, attribute, value)` order.
    pub fn datoms(&self) -> impl Iterator<Item = Datom> + '_ {
        self.eav.iter().flat_map(|((entity, attribute), values)| {
            values
                .iter()
                .map(move |value| Datom::new(*entity, *attribute, value.clone()))
        })
    }

    fn contains(&self, datom: &Datom) -> bool {
        self.eav
            .get(&(datom.entity, datom.attribute))
            .is_some_and(|values| values.contains(&datom.value))
    }

    fn insert(&mut self, datom: &Datom) -> bool {
        let fresh = self
            .eav
            .entry((datom.entity, datom.attribute))
            .or_default()
            .insert(datom.value.clone());
        if fresh {
            self.ave
                .entry((datom.attribute, datom.value.clone()))
                .or_default()
                .insert(datom.entity);
            self.next_entity = self.next_entity.max(datom.entity.0.saturating_add(1));
        }
        fresh
    }

    fn remove(&mut self, datom: &Datom) -> bool {
        let key = (datom.entity, datom.attribute);
        let Some(values) = self.eav.get_mut(&key) else {
            return false;
        };
        if !values.remove(&datom.value) {
            return false;
        }
        if values.is_empty() {
            self.eav.remove(&key);
        }
        let index = (datom.attribute, datom.value.clone());
        if let Some(entities) = self.ave.get_mut(&index) {
            entities.remove(&datom.entity);
            if entities.is_empty() {
                self.ave.remove(&index);
            }
        }
        true
    }
}

impl Snapshot for MemSnapshot {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn values(&self, entity: EntityId, attribute: Attribute) -> Vec<Value> {
        self.eav
            .get(&(entity, attribute))
            .map(|values| values.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn entities(&self, attribute: Attribute, value: &Value) -> Vec<EntityId> {
        self.ave
            .get(&(attribute, value.clone()))
            .map(|entities| entities.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Staged writes against one base snapshot.
///
/// Reads through [`TxBuilder::snapshot`] see the transaction's own writes.
#[derive(Debug)]
pub struct TxBuilder {
    working: MemSnapshot,
    novelty: Novelty,
}

impl TxBuilder {
    fn new(base: &MemSnapshot) -> Self {
        Self {
            working: base.clone(),
            novelty: Novelty::new(),
        }
    }

    /// Allocates a fresh entity id.
    pub fn new_entity(&mut self) -> EntityId {
        let entity = EntityId(self.working.next_entity);
        self.working.next_entity += 1;
        entity
    }

    /// Asserts a datom. Asserting an existing datom is a no-op.
    pub fn add(
        &mut self,
        entity: EntityId,
        attribute: Attribute,
        value: impl Into<Value>,
    ) -> &mut Self {
        let datom = Datom::new(entity, attribute, value);
        if self.working.insert(&datom) {
            self.novelty.record(datom, true);
        }
        self
    }

    /// Retracts a datom. Retracting a missing datom is a no-op.
    pub fn retract(
        &mut self,
        entity: EntityId,
        attribute: Attribute,
        value: impl Into<Value>,
    ) -> &mut Self {
        let datom = Datom::new(entity, attribute, value);
        if self.working.remove(&datom) {
            self.novelty.record(datom, false);
        }
        self
    }

    /// Replaces every value of `(entity, attribute)` with `value`.
    pub fn set(
        &mut self,
        entity: EntityId,
        attribute: Attribute,
        value: impl Into<Value>,
    ) -> &mut Self {
        let value = value.into();
        for old in self.working.values(entity, attribute) {
            if old != value {
                self.retract(entity, attribute, old);
            }
        }
        self.add(entity, attribute, value)
    }

    /// Retracts every datom of `entity`.
    pub fn retract_entity(&mut self, entity: EntityId) -> &mut Self {
        let doomed: Vec<Datom> = self
            .working
            .eav
            .range((entity, Attribute::new(""))..)
            .take_while(|((e, _), _)| *e == entity)
            .flat_map(|((e, a), values)| values.iter().map(|v| Datom::new(*e, *a, v.clone())))
            .collect();
        for datom in doomed {
            if self.working.remove(&datom) {
                self.novelty.record(datom, false);
            }
        }
        self
    }

    /// Returns true if the working state holds `datom`.
    pub fn contains(&self, datom: &Datom) -> bool {
        self.working.contains(datom)
    }

    /// Working state including this transaction's writes.
    ///
    /// Its timestamp is still the base timestamp.
    pub fn snapshot(&self) -> &MemSnapshot {
        &self.working
    }
}

/// A transaction that has been built but not yet committed.
#[derive(Clone, Debug)]
pub struct PreparedTx {
    change: Change,
    snapshot: Arc<MemSnapshot>,
}

impl PreparedTx {
    /// Timestamp of the snapshot the transaction was built against.
    pub fn base(&self) -> Timestamp {
        self.change.before_timestamp()
    }

    /// Candidate snapshot the commit would publish.
    pub fn candidate(&self) -> &SnapshotRef {
        &self.change.after
    }

    /// The change the commit would publish.
    pub fn change(&self) -> &Change {
        &self.change
    }

    /// Returns true if the transaction has no net effect.
    pub fn is_empty(&self) -> bool {
        self.change.novelty.is_empty()
    }
}

/// The database moved on since the transaction was prepared.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("commit conflict: prepared against {base}, database is at {current}")]
pub struct CommitConflict {
    /// Base timestamp of the rejected transaction.
    pub base: Timestamp,
    /// Timestamp the database is actually at.
    pub current: Timestamp,
}

#[derive(Debug, Default)]
struct Inner {
    latest: Arc<MemSnapshot>,
    listeners: Vec<mpsc::UnboundedSender<Change>>,
}

/// Shared handle to an in-memory, versioned fact store.
#[derive(Clone, Debug, Default)]
pub struct Database {
    inner: Arc<Mutex<Inner>>,
}

impl Database {
    /// Creates an empty database at [`Timestamp::ZERO`].
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Latest committed snapshot.
    pub fn latest(&self) -> Arc<MemSnapshot> {
        Arc::clone(&self.lock().latest)
    }

    /// Latest committed timestamp.
    pub fn timestamp(&self) -> Timestamp {
        self.lock().latest.timestamp
    }

    /// Returns the latest snapshot and a stream of every later change.
    ///
    /// Both are taken under one lock, so the first change received always
    /// starts at the returned snapshot.
    pub fn changes(&self) -> (Arc<MemSnapshot>, mpsc::UnboundedReceiver<Change>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.listeners.push(tx);
        (Arc::clone(&inner.latest), rx)
    }

    /// Builds a transaction against the latest snapshot without committing it.
    pub fn prepare<F>(&self, build: F) -> PreparedTx
    where
        F: FnOnce(&mut TxBuilder),
    {
        let base = self.latest();
        let mut tx = TxBuilder::new(&base);
        build(&mut tx);
        let TxBuilder {
            mut working,
            novelty,
        } = tx;
        let before: SnapshotRef = base.clone();
        let snapshot = if novelty.is_empty() {
            base
        } else {
            working.timestamp = base.timestamp.next();
            Arc::new(working)
        };
        let after: SnapshotRef = snapshot.clone();
        PreparedTx {
            change: Change {
                before,
                after,
                novelty,
                meta: ChangeMeta { transactions: 1 },
            },
            snapshot,
        }
    }

    /// Publishes a prepared transaction.
    ///
    /// Empty transactions succeed without creating a snapshot or notifying
    /// listeners.
    ///
    /// # Errors
    ///
    /// Returns [`CommitConflict`] if another commit landed after `prepared`
    /// was built.
    pub fn commit(&self, prepared: PreparedTx) -> Result<Change, CommitConflict> {
        let mut inner = self.lock();
        let current = inner.latest.timestamp;
        if current != prepared.base() {
            return Err(CommitConflict {
                base: prepared.base(),
                current,
            });
        }
        if prepared.is_empty() {
            return Ok(prepared.change);
        }
        inner.latest = prepared.snapshot;
        let change = prepared.change;
        inner
            .listeners
            .retain(|listener| listener.send(change.clone()).is_ok());
        debug!(
            timestamp = %change.after_timestamp(),
            datoms = change.novelty.len(),
            listeners = inner.listeners.len(),
            "committed"
        );
        Ok(change)
    }

    /// Builds and commits a transaction, rebuilding it on conflict.
    pub fn transact<F>(&self, mut build: F) -> Change
    where
        F: FnMut(&mut TxBuilder),
    {
        loop {
            match self.commit(self.prepare(&mut build)) {
                Ok(change) => return change,
                Err(conflict) => debug!(%conflict, "retrying transaction"),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    const AGE: Attribute = Attribute::new("age");
    const NAME: Attribute = Attribute::new("name");

    #[test]
    fn largest_entity_id_is_accepted() {
        let db = Database::new();
        let last = EntityId(u64::MAX);
        db.transact(|tx| {
            tx.add(last, NAME, "last");
        });
        assert_eq!(db.latest().values(last, NAME), vec![Value::from("last")]);
    }

    #[test]
    fn set_replaces_values_and_indexes() {
        let db = Database::new();
        let mut ann = EntityId(0);
        db.transact(|tx| {
            ann = tx.new_entity();
            tx.add(ann, AGE, 30).add(ann, NAME, "ann");
        });
        let change = db.transact(|tx| {
            tx.set(ann, AGE, 31);
        });
        assert_eq!(change.before_timestamp(), Timestamp(1));
        assert_eq!(change.after_timestamp(), Timestamp(2));
        assert_eq!(change.novelty.len(), 2);

        let latest = db.latest();
        assert_eq!(latest.values(ann, AGE), vec![Value::Int(31)]);
        assert!(latest.entities(AGE, &Value::Int(30)).is_empty());
        assert_eq!(latest.entities(AGE, &Value::Int(31)), vec![ann]);
        assert_eq!(latest.len(), 2);
    }

    #[test]
    fn empty_transaction_keeps_timestamp() {
        let db = Database::new();
        let (_, mut changes) = db.changes();
        let change = db.transact(|tx| {
            tx.add(EntityId(1), AGE, 1).retract(EntityId(1), AGE, 1);
        });
        assert!(change.novelty.is_empty());
        assert_eq!(change.after_timestamp(), Timestamp::ZERO);
        assert_eq!(db.timestamp(), Timestamp::ZERO);
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn stale_prepare_conflicts() {
        let db = Database::new();
        let stale = db.prepare(|tx| {
            tx.add(EntityId(1), AGE, 1);
        });
        db.transact(|tx| {
            tx.add(EntityId(2), AGE, 2);
        });
        let err = db.commit(stale).unwrap_err();
        assert_eq!(
            err,
            CommitConflict {
                base: Timestamp(0),
                current: Timestamp(1),
            }
        );
    }

    #[test]
    fn retract_entity_removes_all_attributes() {
        let db = Database::new();
        let mut bob = EntityId(0);
        db.transact(|tx| {
            bob = tx.new_entity();
            let other = tx.new_entity();
            tx.add(bob, AGE, 40).add(bob, NAME, "bob").add(other, AGE, 40);
        });
        let change = db.transact(|tx| {
            tx.retract_entity(bob);
        });
        assert_eq!(change.novelty.retracted().count(), 2);
        assert_eq!(db.latest().entities(AGE, &Value::Int(40)).len(), 1);
    }

    #[test]
    fn listeners_see_every_commit_in_order() {
        let db = Database::new();
        let (start, mut changes) = db.changes();
        assert_eq!(start.timestamp(), Timestamp::ZERO);
        for age in 0..4 {
            db.transact(|tx| {
                tx.set(EntityId(1), AGE, age);
            });
        }
        let mut expected = Timestamp::ZERO;
        while let Ok(change) = changes.try_recv() {
            assert_eq!(change.before_timestamp(), expected);
            expected = change.after_timestamp();
        }
        assert_eq!(expected, Timestamp(4));
    }
}
