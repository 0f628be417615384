// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Producer of a query bound to one upstream match.
//!
//! Emits a wrapper of the source value whose origin is the source. The
//! wrapper is retracted on the first change processed after the source
//! becomes invalid.
use super::{Inputs, Operator, StepCx};
use crate::error::ReteError;
use crate::matches::Match;
use crate::query::Data;
use crate::token::TokenSet;

pub(crate) struct BoundOp<T> {
    source: Match<T>,
    started: bool,
    emitted: Option<Match<T>>,
}

impl<T> BoundOp<T> {
    pub(crate) fn new(source: Match<T>) -> Self {
        Self {
            source,
            started: false,
            emitted: None,
        }
    }
}

impl<T: Data> Operator for BoundOp<T> {
    type Out = T;

    fn step(&mut self, cx: &mut StepCx<'_>, _inputs: &Inputs<'_>) -> Result<TokenSet<T>, ReteError> {
        let mut out = TokenSet::new();
        if !self.started {
            self.started = true;
            if self.source.is_valid() {
                let provenance = cx
                    .provenance()
                    .parent(self.source.handle())
                    .origin(Some(self.source.handle()));
                let wrapper = cx.make(self.source.value().clone(), provenance);
                self.emitted = Some(wrapper.clone());
                out.asserted.push(wrapper);
            }
        } else if !self.source.is_valid() {
            if let Some(wrapper) = self.emitted.take() {
                out.retracted.push(wrapper);
            }
        }
        Ok(out)
    }
}
