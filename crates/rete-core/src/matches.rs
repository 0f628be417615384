// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Matches, their validity signals and transactional validation.
//!
//! A [`Match`] pairs a value with a [`MatchHandle`]. The handle is shared by
//! every clone of the match and carries a one-way validity flag: the producer
//! that emitted the match flips it exactly once, when it retracts or disposes
//! the match. Async waiters observe the flip through
//! [`MatchHandle::invalidated`].
//!
//! Handles also remember how the match was derived (re-check closure, parent
//! matches, origin) so the transactional interceptor can ask whether the match
//! would survive a candidate snapshot before it is committed.
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

use crate::error::ReteError;
use crate::ident::{MatchId, Timestamp};
use crate::query::{Data, Maybe, Query};
use crate::snapshot::Snapshot;

/// Why a match stopped being valid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvalidationReason {
    /// The producer retracted the match while processing the change to `at`.
    Retracted {
        /// Retracted match.
        match_id: MatchId,
        /// Timestamp of the change that retracted it.
        at: Timestamp,
    },
    /// The producer was torn down because nobody observes it anymore.
    Disposed {
        /// Disposed match.
        match_id: MatchId,
    },
    /// The network was poisoned.
    Poisoned(ReteError),
    /// A single-valued query had no match to run against.
    Absent,
}

impl InvalidationReason {
    /// The match the reason refers to, if it names one.
    pub fn match_id(&self) -> Option<MatchId> {
        match self {
            Self::Retracted { match_id, .. } | Self::Disposed { match_id } => Some(*match_id),
            Self::Poisoned(_) | Self::Absent => None,
        }
    }

    /// Returns true if the match went away because its producer was torn down.
    pub fn is_disposal(&self) -> bool {
        matches!(self, Self::Disposed { .. })
    }
}

impl core::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Retracted { match_id, at } => write!(f, "{match_id} retracted at {at}"),
            Self::Disposed { match_id } => write!(f, "{match_id} disposed"),
            Self::Poisoned(err) => write!(f, "network poisoned: {err}"),
            Self::Absent => f.write_str("no match"),
        }
    }
}

/// Current state of a match handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Validity {
    /// Still asserted by its producer.
    Valid,
    /// Retracted or disposed; terminal.
    Invalidated(InvalidationReason),
}

/// A match the caller depended on is no longer valid.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("match no longer satisfied: {reason}")]
pub struct UnsatisfiedMatch {
    reason: InvalidationReason,
}

impl UnsatisfiedMatch {
    /// Wraps an invalidation reason.
    pub fn new(reason: InvalidationReason) -> Self {
        Self { reason }
    }

    /// Why the match became invalid.
    pub fn reason(&self) -> &InvalidationReason {
        &self.reason
    }

    /// Returns true if the failure was a producer disposal.
    pub fn is_disposal(&self) -> bool {
        self.reason.is_disposal()
    }
}

/// Re-evaluates whether a match would still be produced from a snapshot.
pub(crate) type Recheck = Arc<dyn Fn(&dyn Snapshot) -> bool + Send + Sync>;

/// How a match was derived.
pub(crate) struct Provenance {
    computed_at: Timestamp,
    recheck: Option<Recheck>,
    parents: Vec<MatchHandle>,
    origin: Option<MatchHandle>,
}

impl Provenance {
    pub(crate) fn at(computed_at: Timestamp) -> Self {
        Self {
            computed_at,
            recheck: None,
            parents: Vec::new(),
            origin: None,
        }
    }

    pub(crate) fn recheck(mut self, recheck: Recheck) -> Self {
        self.recheck = Some(recheck);
        self
    }

    pub(crate) fn parent(mut self, parent: &MatchHandle) -> Self {
        self.parents.push(parent.clone());
        self
    }

    /// Sets the origin unless one was already set.
    pub(crate) fn origin(mut self, origin: Option<&MatchHandle>) -> Self {
        if self.origin.is_none() {
            self.origin = origin.cloned();
        }
        self
    }
}

struct MatchInner {
    id: MatchId,
    computed_at: Timestamp,
    status: watch::Sender<Validity>,
    recheck: Option<Recheck>,
    parents: Vec<MatchHandle>,
    origin: Option<MatchHandle>,
}

/// Shared identity and validity signal of one match.
#[derive(Clone)]
pub struct MatchHandle(Arc<MatchInner>);

impl MatchHandle {
    pub(crate) fn new(id: MatchId, provenance: Provenance) -> Self {
        let (status, _) = watch::channel(Validity::Valid);
        Self(Arc::new(MatchInner {
            id,
            computed_at: provenance.computed_at,
            status,
            recheck: provenance.recheck,
            parents: provenance.parents,
            origin: provenance.origin,
        }))
    }

    /// Identity of the match.
    pub fn id(&self) -> MatchId {
        self.0.id
    }

    /// Timestamp of the snapshot the match was computed against.
    pub fn computed_at(&self) -> Timestamp {
        self.0.computed_at
    }

    /// Current validity.
    pub fn validity(&self) -> Validity {
        self.0.status.borrow().clone()
    }

    /// Returns true until the match is retracted or disposed.
    pub fn is_valid(&self) -> bool {
        matches!(*self.0.status.borrow(), Validity::Valid)
    }

    /// Why the match is invalid, if it is.
    pub fn invalidation(&self) -> Option<InvalidationReason> {
        match &*self.0.status.borrow() {
            Validity::Valid => None,
            Validity::Invalidated(reason) => Some(reason.clone()),
        }
    }

    /// Upstream match this one was derived from through a bound query.
    pub fn origin(&self) -> Option<&Self> {
        self.0.origin.as_ref()
    }

    /// This handle followed by its origin chain.
    pub fn lineage(&self) -> Vec<Self> {
        let mut chain = vec![self.clone()];
        let mut cursor = self.origin();
        while let Some(origin) = cursor {
            chain.push(origin.clone());
            cursor = origin.origin();
        }
        chain
    }

    /// Resolves once the match becomes invalid.
    ///
    /// Resolves immediately for an already-invalid match. The future owns a
    /// subscription and does not borrow the handle.
    pub fn invalidated(&self) -> impl Future<Output = InvalidationReason> + Send + 'static {
        let mut status = self.0.status.subscribe();
        let match_id = self.0.id;
        async move {
            loop {
                let current = status.borrow_and_update().clone();
                if let Validity::Invalidated(reason) = current {
                    return reason;
                }
                if status.changed().await.is_err() {
                    return InvalidationReason::Disposed { match_id };
                }
            }
        }
    }

    /// Flips the handle to invalid. Returns false if it already was.
    pub(crate) fn invalidate(&self, reason: InvalidationReason) -> bool {
        self.0.status.send_if_modified(|status| match status {
            Validity::Valid => {
                *status = Validity::Invalidated(reason);
                true
            }
            Validity::Invalidated(_) => false,
        })
    }

    /// Checks the match against a candidate snapshot.
    ///
    /// Fails with the first handle in the derivation (this one, a parent or an
    /// origin) that is already invalid or whose re-check rejects `candidate`.
    /// Every operator that derives a value from the snapshot attaches a
    /// re-check, and so does single to keep its input at one value. Union,
    /// join and bound matches are decided by their parents. Only the unit
    /// match carries neither and holds everywhere.
    ///
    /// # Errors
    ///
    /// Returns the offending handle.
    pub fn validate(&self, candidate: &dyn Snapshot) -> Result<(), Self> {
        if !self.is_valid() {
            return Err(self.clone());
        }
        if let Some(recheck) = &self.0.recheck {
            if !recheck(candidate) {
                return Err(self.clone());
            }
        }
        for parent in &self.0.parents {
            parent.validate(candidate)?;
        }
        if let Some(origin) = &self.0.origin {
            origin.validate(candidate)?;
        }
        Ok(())
    }
}

impl PartialEq for MatchHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for MatchHandle {}

impl Hash for MatchHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl core::fmt::Debug for MatchHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MatchHandle")
            .field("id", &self.0.id)
            .field("computed_at", &self.0.computed_at)
            .field("validity", &*self.0.status.borrow())
            .finish_non_exhaustive()
    }
}

/// A value produced by a query, with its identity and validity signal.
///
/// Equality and hashing use the match id only.
#[derive(Clone)]
pub struct Match<T> {
    value: T,
    handle: MatchHandle,
}

impl<T> Match<T> {
    pub(crate) fn new(id: MatchId, value: T, provenance: Provenance) -> Self {
        Self {
            value,
            handle: MatchHandle::new(id, provenance),
        }
    }

    /// The matched value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Consumes the match, returning its value.
    pub fn into_value(self) -> T {
        self.value
    }

    /// Shared handle of the match.
    pub fn handle(&self) -> &MatchHandle {
        &self.handle
    }

    /// Identity of the match.
    pub fn id(&self) -> MatchId {
        self.handle.id()
    }

    /// Returns true until the match is retracted or disposed.
    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    /// Upstream match this one was derived from through a bound query.
    pub fn origin(&self) -> Option<&MatchHandle> {
        self.handle.origin()
    }
}

impl<T: Data> Match<T> {
    /// A query that yields exactly this match's value while it stays valid.
    pub fn bind(&self) -> BoundQuery<T> {
        BoundQuery {
            source: self.clone(),
        }
    }
}

impl<T> PartialEq for Match<T> {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl<T> Eq for Match<T> {}

impl<T> Hash for Match<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handle.hash(state);
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for Match<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Match")
            .field("id", &self.id())
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

/// A query sourced from one upstream match.
///
/// Matches derived from it report the source through
/// [`MatchHandle::origin`].
#[derive(Clone, Debug)]
pub struct BoundQuery<T> {
    source: Match<T>,
}

impl<T: Data> BoundQuery<T> {
    /// The match the query is bound to.
    pub fn source(&self) -> &Match<T> {
        &self.source
    }

    /// The bound query. Yields the source while it is valid, then nothing.
    pub fn query(&self) -> Query<T, Maybe> {
        Query::bound(self.source.clone())
    }

    /// Returns true if `derived` was produced (transitively) from the source.
    pub fn is_origin_of(&self, derived: &MatchHandle) -> bool {
        derived
            .lineage()
            .iter()
            .skip(1)
            .any(|handle| handle.id() == self.source.id())
    }
}

/// Outcome of validating dependencies against a candidate snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationResult {
    /// Every dependency survives and the network has seen the base snapshot.
    Valid,
    /// This dependency is (or would become) invalid.
    Invalid(MatchHandle),
    /// The network has not yet caught up with the base snapshot.
    Inconclusive,
}

/// Validates dependency matches against a prepared transaction.
///
/// `base` is the snapshot the transaction was built on, `candidate` the
/// snapshot it would publish and `visible` the latest timestamp the network
/// has processed. A dependency that is already invalid or whose re-check
/// rejects `candidate` is decisive. Otherwise the verdict is only conclusive
/// once the network has observed `base`. No dependencies is always valid.
pub fn validate_all<'a, I>(
    dependencies: I,
    base: Timestamp,
    candidate: &dyn Snapshot,
    visible: Timestamp,
) -> ValidationResult
where
    I: IntoIterator<Item = &'a MatchHandle>,
{
    let mut any = false;
    for handle in dependencies {
        any = true;
        if let Err(offending) = handle.validate(candidate) {
            return ValidationResult::Invalid(offending);
        }
    }
    if any && visible < base {
        ValidationResult::Inconclusive
    } else {
        ValidationResult::Valid
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemSnapshot;

    fn handle(id: u64) -> MatchHandle {
        MatchHandle::new(MatchId::from_raw(id), Provenance::at(Timestamp::ZERO))
    }

    #[test]
    fn invalidation_is_one_way() {
        let h = handle(1);
        assert!(h.is_valid());
        let first = InvalidationReason::Retracted {
            match_id: h.id(),
            at: Timestamp(3),
        };
        assert!(h.invalidate(first.clone()));
        assert!(!h.invalidate(InvalidationReason::Disposed { match_id: h.id() }));
        assert_eq!(h.invalidation(), Some(first));
    }

    #[tokio::test]
    async fn invalidated_resolves_for_past_and_future_flips() {
        let early = handle(1);
        early.invalidate(InvalidationReason::Absent);
        assert_eq!(early.invalidated().await, InvalidationReason::Absent);

        let late = handle(2);
        let waiter = late.invalidated();
        late.invalidate(InvalidationReason::Disposed { match_id: late.id() });
        assert!(waiter.await.is_disposal());
    }

    #[test]
    fn validate_walks_parents_and_origin() {
        let origin = handle(1);
        let parent = handle(2);
        let child = MatchHandle::new(
            MatchId::from_raw(3),
            Provenance::at(Timestamp::ZERO)
                .parent(&parent)
                .origin(Some(&origin)),
        );
        let snapshot = MemSnapshot::default();
        assert!(child.validate(&snapshot).is_ok());

        origin.invalidate(InvalidationReason::Absent);
        assert_eq!(child.validate(&snapshot).unwrap_err(), origin);
        assert_eq!(child.lineage(), vec![child.clone(), origin]);
    }

    #[test]
    fn recheck_rejection_is_invalid_even_when_behind() {
        let rejecting = MatchHandle::new(
            MatchId::from_raw(1),
            Provenance::at(Timestamp::ZERO).recheck(Arc::new(|_: &dyn Snapshot| false)),
        );
        let accepting = handle(2);
        let snapshot = MemSnapshot::default();

        assert_eq!(
            validate_all([&accepting], Timestamp(2), &snapshot, Timestamp(1)),
            ValidationResult::Inconclusive
        );
        assert_eq!(
            validate_all([&accepting], Timestamp(2), &snapshot, Timestamp(2)),
            ValidationResult::Valid
        );
        assert_eq!(
            validate_all(std::iter::empty::<&MatchHandle>(), Timestamp(2), &snapshot, Timestamp(0)),
            ValidationResult::Valid
        );
        assert_eq!(
            validate_all([&accepting, &rejecting], Timestamp(2), &snapshot, Timestamp(1)),
            ValidationResult::Invalid(rejecting)
        );
    }
}
