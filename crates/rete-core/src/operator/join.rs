// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Keyed equi-join; `product` is the join on the unit key.
//!
//! Both sides are indexed by key. An assertion on one side pairs only with
//! the opposite side's matches under the same key, so work per change is
//! proportional to the affected keys rather than to the size of either side.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::{Inputs, Operator, StepCx};
use crate::error::ReteError;
use crate::ident::MatchId;
use crate::matches::Match;
use crate::query::Data;
use crate::token::TokenSet;

/// Key extractor for one side of a join.
pub(crate) type KeyFn<T, K> = Arc<dyn Fn(&T) -> K + Send + Sync>;

struct Side<T, K> {
    key: KeyFn<T, K>,
    live: BTreeMap<MatchId, (Match<T>, K)>,
    index: FxHashMap<K, BTreeSet<MatchId>>,
}

impl<T: Data, K: Data> Side<T, K> {
    fn new(key: KeyFn<T, K>) -> Self {
        Self {
            key,
            live: BTreeMap::new(),
            index: FxHashMap::default(),
        }
    }

    fn insert(&mut self, matched: &Match<T>) -> Option<K> {
        if self.live.contains_key(&matched.id()) {
            return None;
        }
        let key = (self.key)(matched.value());
        self.index
            .entry(key.clone())
            .or_default()
            .insert(matched.id());
        self.live.insert(matched.id(), (matched.clone(), key.clone()));
        Some(key)
    }

    fn remove(&mut self, id: MatchId) -> bool {
        let Some((_, key)) = self.live.remove(&id) else {
            return false;
        };
        if let Some(ids) = self.index.get_mut(&key) {
            ids.remove(&id);
            if ids.is_empty() {
                self.index.remove(&key);
            }
        }
        true
    }

    fn partners(&self, key: &K) -> Vec<Match<T>> {
        self.index
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|id| self.live.get(id))
            .map(|(matched, _)| matched.clone())
            .collect()
    }
}

pub(crate) struct JoinOp<L, R, K> {
    left: Side<L, K>,
    right: Side<R, K>,
    pairs: BTreeMap<(MatchId, MatchId), Match<(L, R)>>,
    by_right: FxHashMap<MatchId, BTreeSet<MatchId>>,
}

impl<L: Data, R: Data, K: Data> JoinOp<L, R, K> {
    pub(crate) fn new(left_key: KeyFn<L, K>, right_key: KeyFn<R, K>) -> Self {
        Self {
            left: Side::new(left_key),
            right: Side::new(right_key),
            pairs: BTreeMap::new(),
            by_right: FxHashMap::default(),
        }
    }

    fn pair(&mut self, cx: &mut StepCx<'_>, left: &Match<L>, right: &Match<R>) -> Match<(L, R)> {
        let provenance = cx
            .provenance()
            .parent(left.handle())
            .parent(right.handle())
            .origin(left.origin())
            .origin(right.origin());
        let paired = cx.make((left.value().clone(), right.value().clone()), provenance);
        self.pairs.insert((left.id(), right.id()), paired.clone());
        self.by_right.entry(right.id()).or_default().insert(left.id());
        paired
    }
}

impl<L: Data, R: Data, K: Data> Operator for JoinOp<L, R, K> {
    type Out = (L, R);

    fn step(
        &mut self,
        cx: &mut StepCx<'_>,
        inputs: &Inputs<'_>,
    ) -> Result<TokenSet<(L, R)>, ReteError> {
        let mut out = TokenSet::new();
        let lefts = inputs.get::<L>(0)?;
        let rights = inputs.get::<R>(1)?;

        if let Some(set) = lefts {
            for retracted in &set.retracted {
                let id = retracted.id();
                if !self.left.remove(id) {
                    return Err(inputs.unbalanced(id));
                }
                let doomed: Vec<(MatchId, MatchId)> = self
                    .pairs
                    .range((id, MatchId::MIN)..=(id, MatchId::MAX))
                    .map(|(pair, _)| *pair)
                    .collect();
                for (l, r) in doomed {
                    if let Some(paired) = self.pairs.remove(&(l, r)) {
                        out.retracted.push(paired);
                    }
                    if let Some(ls) = self.by_right.get_mut(&r) {
                        ls.remove(&l);
                        if ls.is_empty() {
                            self.by_right.remove(&r);
                        }
                    }
                }
            }
        }
        if let Some(set) = rights {
            for retracted in &set.retracted {
                let id = retracted.id();
                if !self.right.remove(id) {
                    return Err(inputs.unbalanced(id));
                }
                for l in self.by_right.remove(&id).unwrap_or_default() {
                    if let Some(paired) = self.pairs.remove(&(l, id)) {
                        out.retracted.push(paired);
                    }
                }
            }
        }

        // Left assertions see the right side before this step's right
        // assertions, which then pair with every live left match.
        if let Some(set) = lefts {
            for asserted in &set.asserted {
                let key = self
                    .left
                    .insert(asserted)
                    .ok_or_else(|| inputs.duplicate(asserted.id()))?;
                for partner in self.right.partners(&key) {
                    out.asserted.push(self.pair(cx, asserted, &partner));
                }
            }
        }
        if let Some(set) = rights {
            for asserted in &set.asserted {
                let key = self
                    .right
                    .insert(asserted)
                    .ok_or_else(|| inputs.duplicate(asserted.id()))?;
                for partner in self.left.partners(&key) {
                    out.asserted.push(self.pair(cx, &partner, asserted));
                }
            }
        }
        Ok(out)
    }
}
