// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! At-most-one restriction.
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Inputs, Operator, StepCx};
use crate::error::ReteError;
use crate::ident::MatchId;
use crate::matches::{Match, Recheck};
use crate::query::{Data, Plan};
use crate::snapshot::Snapshot;
use crate::token::TokenSet;

/// Re-emits its input, failing once more than one match is live.
///
/// Its matches also re-check that the input yields at most one value on a
/// candidate snapshot; the parent covers which one.
pub(crate) struct SingleOp<T> {
    input: Arc<Plan>,
    current: BTreeMap<MatchId, Match<T>>,
}

impl<T> SingleOp<T> {
    pub(crate) fn new(input: Arc<Plan>) -> Self {
        Self {
            input,
            current: BTreeMap::new(),
        }
    }
}

fn still_alone<T: Data>(input: &Arc<Plan>) -> Recheck {
    let input = Arc::clone(input);
    Arc::new(move |snapshot: &dyn Snapshot| {
        input
            .evaluate::<T>(snapshot)
            .is_ok_and(|set| set.asserted.len() <= 1)
    })
}

impl<T: Data> Operator for SingleOp<T> {
    type Out = T;

    fn step(&mut self, cx: &mut StepCx<'_>, inputs: &Inputs<'_>) -> Result<TokenSet<T>, ReteError> {
        let mut out = TokenSet::new();
        let Some(set) = inputs.get::<T>(0)? else {
            return Ok(out);
        };
        for upstream in &set.retracted {
            let own = self
                .current
                .remove(&upstream.id())
                .ok_or_else(|| inputs.unbalanced(upstream.id()))?;
            out.retracted.push(own);
        }
        for upstream in &set.asserted {
            let provenance = cx
                .provenance()
                .parent(upstream.handle())
                .origin(upstream.origin())
                .recheck(still_alone::<T>(&self.input));
            let own = cx.make(upstream.value().clone(), provenance);
            if self.current.insert(upstream.id(), own.clone()).is_some() {
                return Err(inputs.duplicate(upstream.id()));
            }
            out.asserted.push(own);
        }
        if self.current.len() > 1 {
            return Err(ReteError::MultipleMatches {
                query: std::sync::Arc::clone(inputs.label()),
                count: self.current.len(),
            });
        }
        Ok(out)
    }
}
