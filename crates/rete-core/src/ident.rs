// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Identifier, timestamp and query-key utilities.
use std::hash::Hasher as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// Canonical 256-bit digest used for interned query keys.
pub type Hash = [u8; 32];

/// Position of a snapshot in the database's total order.
///
/// Timestamps are strictly increasing across committed snapshots. The network
/// and every match remember the timestamp they were computed against.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The timestamp of the empty database.
    pub const ZERO: Self = Self(0);

    /// Returns the timestamp immediately after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the underlying raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Identifier of an entity in the fact store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct EntityId(pub u64);

impl core::fmt::Display for EntityId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Name of an attribute. Attributes are declared as constants by schemas.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Attribute(&'static str);

impl Attribute {
    /// Declares an attribute by name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Returns the attribute name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        self.0
    }
}

impl core::fmt::Display for Attribute {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, ":{}", self.0)
    }
}

/// Identity of a single match. Never reused within a network.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct MatchId(u64);

impl MatchId {
    pub(crate) const MIN: Self = Self(0);
    pub(crate) const MAX: Self = Self(u64::MAX);

    pub(crate) const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for MatchId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Key of one observer registered with a network.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ObserverId(u64);

impl ObserverId {
    pub(crate) const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// Arena index of a producer. Allocated monotonically, so ascending order is a
/// topological order (inputs are always created before their consumers).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub(crate) struct NodeId(pub(crate) u64);

/// Sharing key of a query's producer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum QueryKey {
    /// Identity of one constructed query value; clones share it.
    Anonymous(u64),
    /// Explicit `intern` key: equal keys share one producer.
    Interned(Hash),
    /// Query bound to a single match via [`crate::Match::bind`].
    Bound(MatchId),
}

static NEXT_ANONYMOUS: AtomicU64 = AtomicU64::new(1);

impl QueryKey {
    pub(crate) fn anonymous() -> Self {
        Self::Anonymous(NEXT_ANONYMOUS.fetch_add(1, Ordering::Relaxed))
    }
}

/// Adapts blake3 to [`std::hash::Hasher`] so any `Hash` key can be digested.
struct DigestWriter(blake3::Hasher);

impl std::hash::Hasher for DigestWriter {
    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finish(&self) -> u64 {
        let digest = self.0.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(head)
    }
}

/// Derives an interned query key from a label, the output type and a key value.
///
/// The label is domain-separated (`intern:`) and the output type is part of
/// the digest, so equal keys for queries of different value types never
/// share a producer.
pub fn make_intern_key<K: std::hash::Hash + ?Sized>(
    label: &str,
    output: std::any::TypeId,
    key: &K,
) -> QueryKey {
    let mut writer = DigestWriter(blake3::Hasher::new());
    writer.write(b"intern:");
    writer.write(label.as_bytes());
    std::hash::Hash::hash(&output, &mut writer);
    key.hash(&mut writer);
    QueryKey::Interned(writer.0.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::TypeId;

    #[test]
    fn intern_key_deterministic() {
        let a = make_intern_key("ages", TypeId::of::<i64>(), &("person", 7u64));
        let b = make_intern_key("ages", TypeId::of::<i64>(), &("person", 7u64));
        assert_eq!(a, b, "same label and key should produce same key");
    }

    #[test]
    fn intern_key_separates_types_and_keys() {
        let base = make_intern_key("ages", TypeId::of::<i64>(), &1u64);
        assert_ne!(base, make_intern_key("ages", TypeId::of::<u64>(), &1u64));
        assert_ne!(base, make_intern_key("ages", TypeId::of::<i64>(), &2u64));
        assert_ne!(base, make_intern_key("names", TypeId::of::<i64>(), &1u64));
    }

    #[test]
    fn anonymous_keys_unique() {
        assert_ne!(QueryKey::anonymous(), QueryKey::anonymous());
    }

    #[test]
    fn timestamp_next_is_monotonic() {
        assert!(Timestamp::ZERO < Timestamp::ZERO.next());
        assert_eq!(Timestamp(41).next().value(), 42);
    }
}
