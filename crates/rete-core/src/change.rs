// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Database changes and their novelty.
//!
//! A [`Change`] is the pair of snapshots around one (or several coalesced)
//! commits plus the net set of datoms asserted or retracted between them.
//! Coalescing is exact: opposite operations on the same datom cancel, so a
//! merged change describes the same `before → after` transition as the
//! sequence it replaces.
use std::collections::BTreeMap;

use crate::error::ReteError;
use crate::ident::Timestamp;
use crate::snapshot::{Pattern, SnapshotRef};
use crate::value::Datom;

/// Net datoms asserted (`true`) or retracted (`false`) by a change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Novelty {
    facts: BTreeMap<Datom, bool>,
}

impl Novelty {
    /// Creates empty novelty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one assertion or retraction, cancelling an opposite pending one.
    pub fn record(&mut self, datom: Datom, added: bool) {
        let previous = self.facts.get(&datom).copied();
        match previous {
            Some(prev) if prev != added => {
                self.facts.remove(&datom);
            }
            _ => {
                self.facts.insert(datom, added);
            }
        }
    }

    /// Folds later novelty into this one.
    pub fn merge(&mut self, later: &Self) {
        for (datom, added) in later.iter() {
            self.record(datom.clone(), added);
        }
    }

    /// Returns true if the change had no net effect.
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Number of net datoms.
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    /// Iterates `(datom, added)` in datom order.
    pub fn iter(&self) -> impl Iterator<Item = (&Datom, bool)> + '_ {
        self.facts.iter().map(|(datom, added)| (datom, *added))
    }

    /// Datoms asserted by the change.
    pub fn added(&self) -> impl Iterator<Item = &Datom> + '_ {
        self.iter().filter(|(_, added)| *added).map(|(datom, _)| datom)
    }

    /// Datoms retracted by the change.
    pub fn retracted(&self) -> impl Iterator<Item = &Datom> + '_ {
        self.iter().filter(|(_, added)| !*added).map(|(datom, _)| datom)
    }

    /// Returns true if any datom can affect a lookup of `pattern`.
    pub fn touches(&self, pattern: &Pattern) -> bool {
        self.facts.keys().any(|datom| pattern.matches(datom))
    }
}

/// Bookkeeping carried alongside a change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChangeMeta {
    /// Number of committed transactions folded into this change.
    pub transactions: u32,
}

/// Transition between two snapshots.
#[derive(Clone, Debug)]
pub struct Change {
    /// Snapshot the change applies to.
    pub before: SnapshotRef,
    /// Snapshot the change produces.
    pub after: SnapshotRef,
    /// Net datoms between `before` and `after`.
    pub novelty: Novelty,
    /// Bookkeeping.
    pub meta: ChangeMeta,
}

impl Change {
    /// Timestamp of `before`.
    pub fn before_timestamp(&self) -> Timestamp {
        self.before.timestamp()
    }

    /// Timestamp of `after`.
    pub fn after_timestamp(&self) -> Timestamp {
        self.after.timestamp()
    }

    /// Merges `next` into this change.
    ///
    /// # Errors
    ///
    /// Returns [`ReteError::NonContiguousChange`] unless `next` starts where
    /// this change ends.
    pub fn coalesce(mut self, next: Self) -> Result<Self, ReteError> {
        if next.before_timestamp() != self.after_timestamp() {
            return Err(ReteError::NonContiguousChange {
                expected: self.after_timestamp(),
                found: next.before_timestamp(),
            });
        }
        self.novelty.merge(&next.novelty);
        self.after = next.after;
        self.meta.transactions = self
            .meta
            .transactions
            .saturating_add(next.meta.transactions);
        Ok(self)
    }
}
