// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Producer operators.
//!
//! Each combinator is an [`Operator`]: a typed state machine that turns its
//! inputs' token sets into its own. [`OperatorNode`] wraps an operator with
//! the bookkeeping every producer shares (the live-match table, balance
//! checks and invalidation of retracted matches) and erases its type so the
//! network can store heterogeneous producers in one arena.
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::change::Novelty;
use crate::error::ReteError;
use crate::ident::{MatchId, Timestamp};
use crate::matches::{InvalidationReason, Match, Provenance};
use crate::query::Data;
use crate::snapshot::Snapshot;
use crate::token::TokenSet;

mod bound;
mod distinct;
mod flat_map;
mod join;
mod reductions;
mod single;
mod union;
mod unit;

pub(crate) use bound::BoundOp;
pub(crate) use distinct::DistinctOp;
pub(crate) use flat_map::{FlatMapFn, FlatMapOp};
pub(crate) use join::{JoinOp, KeyFn};
pub(crate) use reductions::{FoldFn, ReductionsOp};
pub(crate) use single::SingleOp;
pub(crate) use union::UnionOp;
pub(crate) use unit::UnitOp;

/// Type-erased token set as passed between producers.
pub(crate) type AnySet = Arc<dyn Any + Send + Sync>;
/// Borrowed, type-erased token set.
pub(crate) type AnySetRef<'a> = &'a (dyn Any + Send + Sync);

/// Per-step context: the snapshot being propagated and the match id source.
pub(crate) struct StepCx<'a> {
    pub(crate) snapshot: &'a dyn Snapshot,
    pub(crate) novelty: &'a Novelty,
    pub(crate) timestamp: Timestamp,
    next_match: &'a mut u64,
}

impl<'a> StepCx<'a> {
    pub(crate) fn new(
        snapshot: &'a dyn Snapshot,
        novelty: &'a Novelty,
        next_match: &'a mut u64,
    ) -> Self {
        Self {
            snapshot,
            novelty,
            timestamp: snapshot.timestamp(),
            next_match,
        }
    }

    pub(crate) fn provenance(&self) -> Provenance {
        Provenance::at(self.timestamp)
    }

    /// Mints a match with a fresh id.
    pub(crate) fn make<T>(&mut self, value: T, provenance: Provenance) -> Match<T> {
        let id = MatchId::from_raw(*self.next_match);
        *self.next_match += 1;
        Match::new(id, value, provenance)
    }
}

/// Typed view over an operator's input token sets.
pub(crate) struct Inputs<'a> {
    sets: &'a [Option<AnySetRef<'a>>],
    label: &'a Arc<str>,
}

impl<'a> Inputs<'a> {
    /// Token set of input `index`, if that input changed this step.
    pub(crate) fn get<T: Data>(&self, index: usize) -> Result<Option<&'a TokenSet<T>>, ReteError> {
        match self.sets.get(index) {
            Some(Some(set)) => {
                let set: AnySetRef<'a> = *set;
                set.downcast_ref::<TokenSet<T>>()
                    .map(Some)
                    .ok_or_else(|| ReteError::TypeMismatch {
                        query: Arc::clone(self.label),
                    })
            }
            _ => Ok(None),
        }
    }

    pub(crate) fn label(&self) -> &Arc<str> {
        self.label
    }

    pub(crate) fn unbalanced(&self, match_id: MatchId) -> ReteError {
        ReteError::UnbalancedRetract {
            operator: Arc::clone(self.label),
            match_id,
        }
    }

    pub(crate) fn duplicate(&self, match_id: MatchId) -> ReteError {
        ReteError::DuplicateAssert {
            operator: Arc::clone(self.label),
            match_id,
        }
    }
}

/// Why a producer is being disposed.
#[derive(Clone, Debug)]
pub(crate) enum Disposal {
    /// The last observer went away.
    Teardown,
    /// The network was poisoned.
    Poisoned(ReteError),
}

impl Disposal {
    fn reason(&self, match_id: MatchId) -> InvalidationReason {
        match self {
            Self::Teardown => InvalidationReason::Disposed { match_id },
            Self::Poisoned(err) => InvalidationReason::Poisoned(err.clone()),
        }
    }
}

/// Typed incremental operator.
///
/// `step` receives the token sets its inputs emitted for the current change
/// (`None` for inputs that did not change) and returns its own membership
/// changes. On the first step after creation the inputs carry their full
/// current contents as assertions and the novelty is empty.
pub(crate) trait Operator: Send + 'static {
    type Out: Data;

    fn step(
        &mut self,
        cx: &mut StepCx<'_>,
        inputs: &Inputs<'_>,
    ) -> Result<TokenSet<Self::Out>, ReteError>;
}

/// Type-erased producer stored in the network arena.
pub(crate) trait ErasedOperator: Send {
    /// Processes one change. Returns the emitted set, or `None` if empty.
    fn step(
        &mut self,
        cx: &mut StepCx<'_>,
        inputs: &[Option<AnySetRef<'_>>],
    ) -> Result<Option<AnySet>, ReteError>;

    /// Every live match as assertions.
    fn replay(&self) -> AnySet;

    /// Number of live matches.
    fn live_count(&self) -> usize;

    /// Invalidates every live match and forgets them.
    fn dispose(&mut self, cause: &Disposal);
}

/// Shared producer bookkeeping around a typed operator.
pub(crate) struct OperatorNode<O: Operator> {
    label: Arc<str>,
    op: O,
    live: BTreeMap<MatchId, Match<O::Out>>,
}

impl<O: Operator> OperatorNode<O> {
    pub(crate) fn boxed(label: Arc<str>, op: O) -> Box<dyn ErasedOperator> {
        Box::new(Self {
            label,
            op,
            live: BTreeMap::new(),
        })
    }
}

impl<O: Operator> ErasedOperator for OperatorNode<O> {
    fn step(
        &mut self,
        cx: &mut StepCx<'_>,
        inputs: &[Option<AnySetRef<'_>>],
    ) -> Result<Option<AnySet>, ReteError> {
        let inputs = Inputs {
            sets: inputs,
            label: &self.label,
        };
        let mut out = self.op.step(cx, &inputs)?;
        for retracted in &out.retracted {
            if self.live.remove(&retracted.id()).is_none() {
                return Err(inputs.unbalanced(retracted.id()));
            }
            retracted.handle().invalidate(InvalidationReason::Retracted {
                match_id: retracted.id(),
                at: cx.timestamp,
            });
        }
        for asserted in &out.asserted {
            if self.live.insert(asserted.id(), asserted.clone()).is_some() {
                return Err(inputs.duplicate(asserted.id()));
            }
        }
        if out.is_empty() {
            return Ok(None);
        }
        out.sort();
        let set: AnySet = Arc::new(out);
        Ok(Some(set))
    }

    fn replay(&self) -> AnySet {
        let set = TokenSet {
            asserted: self.live.values().cloned().collect(),
            retracted: Vec::new(),
        };
        Arc::new(set)
    }

    fn live_count(&self) -> usize {
        self.live.len()
    }

    fn dispose(&mut self, cause: &Disposal) {
        for (id, live) in std::mem::take(&mut self.live) {
            live.handle().invalidate(cause.reason(id));
        }
    }
}
