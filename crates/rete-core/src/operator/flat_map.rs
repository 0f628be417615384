// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-match expansion with read tracking.
//!
//! `map`, `map_match`, `filter` and `flat_map` all compile to this operator.
//! For each input match it remembers the values it produced and the snapshot
//! patterns the closure read. A change re-runs the closure only for inputs
//! whose patterns intersect the novelty, and only the difference between the
//! old and new outputs is emitted.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use super::{Inputs, Operator, StepCx};
use crate::error::ReteError;
use crate::ident::MatchId;
use crate::matches::{Match, Recheck};
use crate::query::Data;
use crate::snapshot::{DbView, Pattern, Snapshot};
use crate::token::TokenSet;

/// Expansion closure shared by the producer and the re-checks of its matches.
pub(crate) type FlatMapFn<I, O> = Arc<dyn Fn(&DbView<'_>, &Match<I>) -> Vec<O> + Send + Sync>;

struct Entry<I, O> {
    input: Match<I>,
    reads: BTreeSet<Pattern>,
    outputs: FxHashMap<O, Match<O>>,
}

pub(crate) struct FlatMapOp<I, O> {
    f: FlatMapFn<I, O>,
    entries: BTreeMap<MatchId, Entry<I, O>>,
    watchers: FxHashMap<Pattern, BTreeSet<MatchId>>,
}

impl<I, O> FlatMapOp<I, O> {
    pub(crate) fn new(f: FlatMapFn<I, O>) -> Self {
        Self {
            f,
            entries: BTreeMap::new(),
            watchers: FxHashMap::default(),
        }
    }
}

/// Runs the closure against `snapshot`, deduplicating its output.
fn evaluate<I, O: Data>(
    f: &FlatMapFn<I, O>,
    snapshot: &dyn Snapshot,
    input: &Match<I>,
) -> (Vec<O>, BTreeSet<Pattern>) {
    let view = DbView::new(snapshot);
    let mut values = f(&view, input);
    let mut seen = FxHashSet::default();
    values.retain(|value| seen.insert(value.clone()));
    (values, view.into_reads())
}

fn emit<I: Data, O: Data>(
    cx: &mut StepCx<'_>,
    f: &FlatMapFn<I, O>,
    input: &Match<I>,
    value: O,
) -> Match<O> {
    let recheck: Recheck = {
        let f = Arc::clone(f);
        let input = input.clone();
        let expected = value.clone();
        Arc::new(move |snapshot: &dyn Snapshot| {
            let view = DbView::new(snapshot);
            f(&view, &input).contains(&expected)
        })
    };
    let provenance = cx
        .provenance()
        .recheck(recheck)
        .parent(input.handle())
        .origin(input.origin());
    cx.make(value, provenance)
}

fn watch(watchers: &mut FxHashMap<Pattern, BTreeSet<MatchId>>, id: MatchId, reads: &BTreeSet<Pattern>) {
    for pattern in reads {
        watchers.entry(pattern.clone()).or_default().insert(id);
    }
}

fn unwatch(watchers: &mut FxHashMap<Pattern, BTreeSet<MatchId>>, id: MatchId, reads: &BTreeSet<Pattern>) {
    for pattern in reads {
        if let Some(ids) = watchers.get_mut(pattern) {
            ids.remove(&id);
            if ids.is_empty() {
                watchers.remove(pattern);
            }
        }
    }
}

impl<I: Data, O: Data> Operator for FlatMapOp<I, O> {
    type Out = O;

    fn step(&mut self, cx: &mut StepCx<'_>, inputs: &Inputs<'_>) -> Result<TokenSet<O>, ReteError> {
        let mut out = TokenSet::new();
        let upstream = inputs.get::<I>(0)?;

        if let Some(set) = upstream {
            for input in &set.retracted {
                let entry = self
                    .entries
                    .remove(&input.id())
                    .ok_or_else(|| inputs.unbalanced(input.id()))?;
                unwatch(&mut self.watchers, input.id(), &entry.reads);
                out.retracted.extend(entry.outputs.into_values());
            }
        }

        let dirty: BTreeSet<MatchId> = cx
            .novelty
            .iter()
            .flat_map(|(datom, _)| Pattern::touched_by(datom))
            .filter_map(|pattern| self.watchers.get(&pattern))
            .flatten()
            .copied()
            .collect();
        for id in dirty {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            let (values, reads) = evaluate(&self.f, cx.snapshot, &entry.input);
            let stale: Vec<O> = {
                let fresh: FxHashSet<&O> = values.iter().collect();
                entry
                    .outputs
                    .keys()
                    .filter(|value| !fresh.contains(value))
                    .cloned()
                    .collect()
            };
            for value in stale {
                if let Some(old) = entry.outputs.remove(&value) {
                    out.retracted.push(old);
                }
            }
            for value in values {
                if !entry.outputs.contains_key(&value) {
                    let fresh = emit(cx, &self.f, &entry.input, value.clone());
                    out.asserted.push(fresh.clone());
                    entry.outputs.insert(value, fresh);
                }
            }
            if reads != entry.reads {
                unwatch(&mut self.watchers, id, &entry.reads);
                watch(&mut self.watchers, id, &reads);
                entry.reads = reads;
            }
        }

        if let Some(set) = upstream {
            for input in &set.asserted {
                if self.entries.contains_key(&input.id()) {
                    return Err(inputs.duplicate(input.id()));
                }
                let (values, reads) = evaluate(&self.f, cx.snapshot, input);
                let mut outputs = FxHashMap::default();
                for value in values {
                    let fresh = emit(cx, &self.f, input, value.clone());
                    out.asserted.push(fresh.clone());
                    outputs.insert(value, fresh);
                }
                watch(&mut self.watchers, input.id(), &reads);
                self.entries.insert(
                    input.id(),
                    Entry {
                        input: input.clone(),
                        reads,
                        outputs,
                    },
                );
            }
        }
        Ok(out)
    }
}
