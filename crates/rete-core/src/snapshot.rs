// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Snapshot boundary and read tracking.
//!
//! The network never mutates the database. It only projects over immutable
//! [`Snapshot`]s through a [`DbView`], which records every lookup as a
//! [`Pattern`]. Producers index those patterns so that a change only
//! re-evaluates the inputs whose reads intersect its novelty.
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::ident::{Attribute, EntityId, Timestamp};
use crate::value::{Datom, Value};

/// Immutable, timestamped view of the database.
pub trait Snapshot: Send + Sync + core::fmt::Debug {
    /// Position of this snapshot in the database's total order.
    fn timestamp(&self) -> Timestamp;
    /// Values stored under `(entity, attribute)`, in ascending order.
    fn values(&self, entity: EntityId, attribute: Attribute) -> Vec<Value>;
    /// Entities holding `value` under `attribute`, in ascending order.
    fn entities(&self, attribute: Attribute, value: &Value) -> Vec<EntityId>;
}

/// Shared handle to a snapshot.
pub type SnapshotRef = Arc<dyn Snapshot>;

/// Shape of one recorded lookup.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Pattern {
    /// `values(entity, attribute)`.
    EntityAttribute(EntityId, Attribute),
    /// `entities(attribute, value)`.
    AttributeValue(Attribute, Value),
}

impl Pattern {
    /// Returns true if asserting or retracting `datom` can change the result of
    /// the lookup this pattern describes.
    pub fn matches(&self, datom: &Datom) -> bool {
        match self {
            Self::EntityAttribute(e, a) => datom.entity == *e && datom.attribute == *a,
            Self::AttributeValue(a, v) => datom.attribute == *a && datom.value == *v,
        }
    }

    /// The two patterns a datom can affect; used to look up pattern indexes.
    pub fn touched_by(datom: &Datom) -> [Self; 2] {
        [
            Self::EntityAttribute(datom.entity, datom.attribute),
            Self::AttributeValue(datom.attribute, datom.value.clone()),
        ]
    }
}

/// Read-tracking view handed to combinator closures.
///
/// Closures must be pure functions of the snapshot they read; every lookup is
/// recorded so the owning producer knows when to re-run them.
#[derive(Debug)]
pub struct DbView<'a> {
    snapshot: &'a dyn Snapshot,
    reads: RefCell<BTreeSet<Pattern>>,
}

impl<'a> DbView<'a> {
    /// Wraps a snapshot with an empty read set.
    pub fn new(snapshot: &'a dyn Snapshot) -> Self {
        Self {
            snapshot,
            reads: RefCell::new(BTreeSet::new()),
        }
    }

    /// Timestamp of the underlying snapshot.
    pub fn timestamp(&self) -> Timestamp {
        self.snapshot.timestamp()
    }

    /// All values of `(entity, attribute)`.
    pub fn values(&self, entity: EntityId, attribute: Attribute) -> Vec<Value> {
        self.reads
            .borrow_mut()
            .insert(Pattern::EntityAttribute(entity, attribute));
        self.snapshot.values(entity, attribute)
    }

    /// The smallest value of `(entity, attribute)`, for single-valued attributes.
    pub fn value(&self, entity: EntityId, attribute: Attribute) -> Option<Value> {
        self.values(entity, attribute).into_iter().next()
    }

    /// Entities holding `value` under `attribute`.
    pub fn entities(&self, attribute: Attribute, value: impl Into<Value>) -> Vec<EntityId> {
        let value = value.into();
        let found = self.snapshot.entities(attribute, &value);
        self.reads
            .borrow_mut()
            .insert(Pattern::AttributeValue(attribute, value));
        found
    }

    /// Consumes the view, returning every pattern read through it.
    pub fn into_reads(self) -> BTreeSet<Pattern> {
        self.reads.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    const AGE: Attribute = Attribute::new("age");
    const KIND: Attribute = Attribute::new("kind");

    #[test]
    fn view_records_reads() {
        let db = Database::new();
        let mut person = EntityId(0);
        db.transact(|tx| {
            person = tx.new_entity();
            tx.add(person, KIND, "person").add(person, AGE, 30);
        });
        let snapshot = db.latest();
        let view = DbView::new(snapshot.as_ref());
        assert_eq!(view.entities(KIND, "person"), vec![person]);
        assert_eq!(view.value(person, AGE), Some(Value::Int(30)));

        let reads = view.into_reads();
        assert!(reads.contains(&Pattern::AttributeValue(KIND, Value::from("person"))));
        assert!(reads.contains(&Pattern::EntityAttribute(person, AGE)));
        assert_eq!(reads.len(), 2);
    }

    #[test]
    fn pattern_matches_only_its_shape() {
        let datom = Datom::new(EntityId(1), AGE, 30);
        assert!(Pattern::EntityAttribute(EntityId(1), AGE).matches(&datom));
        assert!(!Pattern::EntityAttribute(EntityId(2), AGE).matches(&datom));
        assert!(Pattern::AttributeValue(AGE, Value::Int(30)).matches(&datom));
        assert!(!Pattern::AttributeValue(AGE, Value::Int(31)).matches(&datom));
        for pattern in Pattern::touched_by(&datom) {
            assert!(pattern.matches(&datom));
        }
    }
}
