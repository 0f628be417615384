// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Set semantics over a bag of matches.
use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::{Inputs, Operator, StepCx};
use crate::error::ReteError;
use crate::ident::MatchId;
use crate::matches::{Match, Recheck};
use crate::query::{Data, Plan};
use crate::snapshot::Snapshot;
use crate::token::TokenSet;

/// Emits one match per distinct value, held while any upstream match
/// carries the value.
///
/// A distinct match outlives the upstream match it was first seen on, so it
/// cannot borrow that match's re-check. It re-evaluates the input instead:
/// the match survives a candidate snapshot iff the input still yields its
/// value there.
pub(crate) struct DistinctOp<T> {
    input: Arc<Plan>,
    upstream: BTreeMap<MatchId, T>,
    counts: FxHashMap<T, (usize, Match<T>)>,
}

impl<T> DistinctOp<T> {
    pub(crate) fn new(input: Arc<Plan>) -> Self {
        Self {
            input,
            upstream: BTreeMap::new(),
            counts: FxHashMap::default(),
        }
    }
}

fn still_yielded<T: Data>(input: &Arc<Plan>, value: &T) -> Recheck {
    let input = Arc::clone(input);
    let value = value.clone();
    Arc::new(move |snapshot: &dyn Snapshot| {
        input
            .evaluate::<T>(snapshot)
            .is_ok_and(|set| set.asserted_values().any(|held| *held == value))
    })
}

impl<T: Data> Operator for DistinctOp<T> {
    type Out = T;

    fn step(&mut self, cx: &mut StepCx<'_>, inputs: &Inputs<'_>) -> Result<TokenSet<T>, ReteError> {
        let mut out = TokenSet::new();
        let Some(set) = inputs.get::<T>(0)? else {
            return Ok(out);
        };
        // Assertions first: a value moving between upstream matches in one
        // change keeps its distinct match.
        for asserted in &set.asserted {
            let value = asserted.value();
            if self.upstream.insert(asserted.id(), value.clone()).is_some() {
                return Err(inputs.duplicate(asserted.id()));
            }
            if let Some((count, _)) = self.counts.get_mut(value) {
                *count += 1;
            } else {
                let provenance = cx.provenance().recheck(still_yielded(&self.input, value));
                let own = cx.make(value.clone(), provenance);
                self.counts.insert(value.clone(), (1, own.clone()));
                out.asserted.push(own);
            }
        }
        for retracted in &set.retracted {
            let value = self
                .upstream
                .remove(&retracted.id())
                .ok_or_else(|| inputs.unbalanced(retracted.id()))?;
            let gone = match self.counts.get_mut(&value) {
                Some((count, _)) => {
                    *count -= 1;
                    *count == 0
                }
                None => return Err(ReteError::InternalCorruption("distinct count missing")),
            };
            if gone {
                if let Some((_, own)) = self.counts.remove(&value) {
                    out.retracted.push(own);
                }
            }
        }
        Ok(out)
    }
}
