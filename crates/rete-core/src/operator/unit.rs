// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The root producer: one `()` match, asserted once and never retracted.
use super::{Inputs, Operator, StepCx};
use crate::error::ReteError;
use crate::token::TokenSet;

#[derive(Debug, Default)]
pub(crate) struct UnitOp {
    emitted: bool,
}

impl Operator for UnitOp {
    type Out = ();

    fn step(&mut self, cx: &mut StepCx<'_>, _inputs: &Inputs<'_>) -> Result<TokenSet<()>, ReteError> {
        let mut out = TokenSet::new();
        if !self.emitted {
            self.emitted = true;
            let provenance = cx.provenance();
            out.asserted.push(cx.make((), provenance));
        }
        Ok(out)
    }
}
