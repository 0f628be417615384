// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Running fold over a token stream.
use std::sync::Arc;

use super::{Inputs, Operator, StepCx};
use crate::error::ReteError;
use crate::matches::{Match, Recheck};
use crate::query::{Data, Plan};
use crate::snapshot::Snapshot;
use crate::token::{Token, TokenSet};

/// Fold step: previous accumulator and one token to the next accumulator.
pub(crate) type FoldFn<T, A> = Arc<dyn Fn(&A, &Token<T>) -> A + Send + Sync>;

/// Holds exactly one match: the accumulator after every token seen so far.
///
/// A change that leaves the accumulator equal emits nothing; otherwise the
/// previous match is retracted and the new one asserted in the same set.
///
/// The accumulator match survives a candidate snapshot iff folding the
/// input's contents there from the seed gives the same accumulator.
pub(crate) struct ReductionsOp<T, A> {
    f: FoldFn<T, A>,
    seed: A,
    input: Arc<Plan>,
    acc: A,
    current: Option<Match<A>>,
}

impl<T, A: Clone> ReductionsOp<T, A> {
    pub(crate) fn new(seed: A, f: FoldFn<T, A>, input: Arc<Plan>) -> Self {
        Self {
            f,
            acc: seed.clone(),
            seed,
            input,
            current: None,
        }
    }
}

impl<T: Data, A: Data> ReductionsOp<T, A> {
    fn refolds_to(&self, expected: &A) -> Recheck {
        let (f, seed, input) = (Arc::clone(&self.f), self.seed.clone(), Arc::clone(&self.input));
        let expected = expected.clone();
        Arc::new(move |snapshot: &dyn Snapshot| {
            input.evaluate::<T>(snapshot).is_ok_and(|set| {
                let acc = set
                    .tokens()
                    .fold(seed.clone(), |acc, token| f(&acc, &token));
                acc == expected
            })
        })
    }
}

impl<T: Data, A: Data> Operator for ReductionsOp<T, A> {
    type Out = A;

    fn step(&mut self, cx: &mut StepCx<'_>, inputs: &Inputs<'_>) -> Result<TokenSet<A>, ReteError> {
        let mut out = TokenSet::new();
        let mut acc = self.acc.clone();
        if let Some(set) = inputs.get::<T>(0)? {
            for token in set.tokens() {
                acc = (self.f)(&acc, &token);
            }
        }
        let changed = acc != self.acc;
        match self.current.take() {
            Some(previous) if !changed => self.current = Some(previous),
            previous => {
                out.retracted.extend(previous);
                let provenance = cx.provenance().recheck(self.refolds_to(&acc));
                let next = cx.make(acc.clone(), provenance);
                out.asserted.push(next.clone());
                self.current = Some(next);
            }
        }
        self.acc = acc;
        Ok(out)
    }
}
