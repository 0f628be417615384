// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Bag union of two producers.
use std::collections::BTreeMap;

use super::{Inputs, Operator, StepCx};
use crate::error::ReteError;
use crate::ident::MatchId;
use crate::matches::Match;
use crate::query::Data;
use crate::token::TokenSet;

/// Re-emits every match of either side under its own identity.
pub(crate) struct UnionOp<T> {
    sides: [BTreeMap<MatchId, Match<T>>; 2],
}

impl<T> UnionOp<T> {
    pub(crate) fn new() -> Self {
        Self {
            sides: [BTreeMap::new(), BTreeMap::new()],
        }
    }
}

impl<T: Data> Operator for UnionOp<T> {
    type Out = T;

    fn step(&mut self, cx: &mut StepCx<'_>, inputs: &Inputs<'_>) -> Result<TokenSet<T>, ReteError> {
        let mut out = TokenSet::new();
        let sets = [inputs.get::<T>(0)?, inputs.get::<T>(1)?];
        for (side, set) in self.sides.iter_mut().zip(sets) {
            let Some(set) = set else { continue };
            for upstream in &set.retracted {
                let own = side
                    .remove(&upstream.id())
                    .ok_or_else(|| inputs.unbalanced(upstream.id()))?;
                out.retracted.push(own);
            }
            for upstream in &set.asserted {
                let provenance = cx
                    .provenance()
                    .parent(upstream.handle())
                    .origin(upstream.origin());
                let own = cx.make(upstream.value().clone(), provenance);
                if side.insert(upstream.id(), own.clone()).is_some() {
                    return Err(inputs.duplicate(upstream.id()));
                }
                out.asserted.push(own);
            }
        }
        Ok(out)
    }
}
