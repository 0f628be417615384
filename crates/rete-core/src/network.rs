// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Producer arena and change propagation.
//!
//! The network owns every live producer in a [`BTreeMap`] keyed by
//! allocation order, which is also a topological order: a producer's inputs
//! are always created before it. Propagating a change is therefore one pass
//! in key order, each producer reading the token sets its inputs emitted
//! earlier in the same pass.
//!
//! Producers are reference counted by their consumers (other producers and
//! observers). When the count reaches zero the producer is disposed at once
//! and its matches are invalidated with
//! [`InvalidationReason::Disposed`](crate::InvalidationReason::Disposed).
//!
//! Any error raised while mutating the network poisons it: every producer is
//! disposed, every observer dropped, and each later call fails with the
//! poisoning error. Panics in user closures are caught and converted to
//! [`ReteError::Panicked`] unless the network is in strict mode.
use std::any::TypeId;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, error, trace};

use crate::change::{Change, Novelty};
use crate::error::{ObserveError, ReteError};
use crate::ident::{NodeId, ObserverId, QueryKey, Timestamp};
use crate::matches::{MatchHandle, UnsatisfiedMatch};
use crate::operator::{AnySet, AnySetRef, Disposal, ErasedOperator, StepCx};
use crate::query::{Cardinality, Data, Plan, Query};
use crate::snapshot::SnapshotRef;
use crate::token::TokenSet;

struct NodeSlot {
    key: QueryKey,
    label: Arc<str>,
    output: TypeId,
    inputs: Vec<NodeId>,
    consumers: usize,
    operator: Box<dyn ErasedOperator>,
}

trait ErasedSink: Send {
    /// Delivers a type-erased token set. Returns false on a type mismatch.
    fn deliver(&mut self, set: AnySetRef<'_>) -> bool;
}

struct TypedSink<T, F> {
    f: F,
    marker: PhantomData<fn(TokenSet<T>)>,
}

impl<T: Data, F: FnMut(TokenSet<T>) + Send> ErasedSink for TypedSink<T, F> {
    fn deliver(&mut self, set: AnySetRef<'_>) -> bool {
        match set.downcast_ref::<TokenSet<T>>() {
            Some(set) => {
                (self.f)(set.clone());
                true
            }
            None => false,
        }
    }
}

struct ObserverSlot {
    node: NodeId,
    label: Arc<str>,
    dependencies: Vec<MatchHandle>,
    sink: Box<dyn ErasedSink>,
}

/// Shared producers plus the observers subscribed to them.
///
/// The network is synchronous. `rete-session` drives it from a single
/// coordinator task; nothing here blocks or awaits.
pub struct Network {
    snapshot: SnapshotRef,
    nodes: BTreeMap<NodeId, NodeSlot>,
    by_key: FxHashMap<QueryKey, NodeId>,
    observers: BTreeMap<ObserverId, ObserverSlot>,
    next_node: u64,
    next_observer: u64,
    next_match: u64,
    poisoned: Option<ReteError>,
    strict: bool,
}

impl core::fmt::Debug for Network {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Network")
            .field("timestamp", &self.timestamp())
            .field("producers", &self.nodes.len())
            .field("observers", &self.observers.len())
            .field("poisoned", &self.poisoned)
            .field("strict", &self.strict)
            .finish()
    }
}

impl Network {
    /// Creates an empty network positioned at `snapshot`.
    pub fn new(snapshot: SnapshotRef) -> Self {
        Self {
            snapshot,
            nodes: BTreeMap::new(),
            by_key: FxHashMap::default(),
            observers: BTreeMap::new(),
            next_node: 0,
            next_observer: 0,
            next_match: 1,
            poisoned: None,
            strict: false,
        }
    }

    /// In strict mode panics from user closures propagate instead of
    /// poisoning the network.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Returns true in strict mode.
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Timestamp of the last snapshot the network processed.
    pub fn timestamp(&self) -> Timestamp {
        self.snapshot.timestamp()
    }

    /// Last snapshot the network processed.
    pub fn snapshot(&self) -> &SnapshotRef {
        &self.snapshot
    }

    /// The poisoning error, if the network is poisoned.
    pub fn poisoned(&self) -> Option<&ReteError> {
        self.poisoned.as_ref()
    }

    /// Number of live producers.
    pub fn producer_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Total matches held by live producers.
    pub fn live_matches(&self) -> usize {
        self.nodes.values().map(|slot| slot.operator.live_count()).sum()
    }

    fn check_running(&self) -> Result<(), ReteError> {
        match &self.poisoned {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Subscribes `sink` to `query`.
    ///
    /// The sink immediately receives one token set asserting every current
    /// match (possibly empty), then one set per later change that affects the
    /// query. The observer is removed automatically once any of
    /// `dependencies` becomes invalid.
    ///
    /// # Errors
    ///
    /// [`ObserveError::Unsatisfied`] if a dependency is already invalid (the
    /// network is left untouched), [`ObserveError::Rete`] if the network is or
    /// becomes poisoned.
    pub fn add_observer<T, C, F>(
        &mut self,
        query: &Query<T, C>,
        dependencies: Vec<MatchHandle>,
        sink: F,
    ) -> Result<ObserverId, ObserveError>
    where
        T: Data,
        C: Cardinality,
        F: FnMut(TokenSet<T>) + Send + 'static,
    {
        self.check_running()?;
        if let Some(reason) = dependencies.iter().find_map(MatchHandle::invalidation) {
            return Err(UnsatisfiedMatch::new(reason).into());
        }
        let plan = Arc::clone(query.plan());
        let id = self.guard(move |network| {
            let node = network.ensure(&plan)?;
            let replay = network
                .nodes
                .get(&node)
                .map(|slot| slot.operator.replay())
                .ok_or(ReteError::InternalCorruption("observed producer missing"))?;
            let mut sink = TypedSink {
                f: sink,
                marker: PhantomData,
            };
            if !sink.deliver(replay.as_ref()) {
                return Err(ReteError::TypeMismatch {
                    query: Arc::clone(&plan.label),
                });
            }
            if let Some(slot) = network.nodes.get_mut(&node) {
                slot.consumers += 1;
            }
            let id = ObserverId::from_raw(network.next_observer);
            network.next_observer += 1;
            network.observers.insert(
                id,
                ObserverSlot {
                    node,
                    label: Arc::clone(&plan.label),
                    dependencies,
                    sink: Box::new(sink),
                },
            );
            debug!(
                observer = id.value(),
                query = %plan.label,
                timestamp = %network.timestamp(),
                "observer added"
            );
            Ok(id)
        })?;
        Ok(id)
    }

    /// Removes an observer, tearing down producers nobody else uses.
    ///
    /// Returns false if the observer was unknown (already removed or pruned).
    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        let Some(observer) = self.observers.remove(&id) else {
            return false;
        };
        debug!(observer = id.value(), query = %observer.label, "observer removed");
        self.release(observer.node);
        true
    }

    /// Applies one change and delivers the resulting token sets.
    ///
    /// A change that ends at or before the current timestamp is ignored.
    ///
    /// # Errors
    ///
    /// Fails, poisoning the network, if the change does not start at the
    /// current timestamp or if any producer or observer fails.
    pub fn apply_change(&mut self, change: &Change) -> Result<(), ReteError> {
        self.check_running()?;
        let current = self.timestamp();
        if change.after_timestamp() <= current {
            trace!(
                timestamp = %change.after_timestamp(),
                current = %current,
                "skipping stale change"
            );
            return Ok(());
        }
        if change.before_timestamp() != current {
            let err = ReteError::NonContiguousChange {
                expected: current,
                found: change.before_timestamp(),
            };
            self.poison(err.clone());
            return Err(err);
        }
        self.guard(|network| network.propagate(change))
    }

    /// Poisons the network with `cause`.
    ///
    /// Every producer is disposed, every outstanding match is invalidated
    /// with the cause, and every observer is dropped. Later poisonings are
    /// ignored.
    pub fn poison(&mut self, cause: ReteError) {
        if self.poisoned.is_some() {
            return;
        }
        error!(
            %cause,
            producers = self.nodes.len(),
            observers = self.observers.len(),
            "network poisoned"
        );
        let disposal = Disposal::Poisoned(cause.clone());
        for slot in self.nodes.values_mut() {
            slot.operator.dispose(&disposal);
        }
        self.nodes.clear();
        self.by_key.clear();
        self.observers.clear();
        self.poisoned = Some(cause);
    }

    fn guard<R>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<R, ReteError>,
    ) -> Result<R, ReteError> {
        let outcome = if self.strict {
            body(self)
        } else {
            match panic::catch_unwind(AssertUnwindSafe(|| body(self))) {
                Ok(outcome) => outcome,
                Err(payload) => Err(ReteError::from_panic(payload.as_ref())),
            }
        };
        if let Err(err) = &outcome {
            self.poison(err.clone());
        }
        outcome
    }

    /// Returns the producer for `plan`, creating it and its inputs if needed.
    fn ensure(&mut self, plan: &Arc<Plan>) -> Result<NodeId, ReteError> {
        if let Some(&id) = self.by_key.get(&plan.key) {
            let slot = self
                .nodes
                .get(&id)
                .ok_or(ReteError::InternalCorruption("interned producer missing"))?;
            if slot.output != plan.output {
                return Err(ReteError::TypeMismatch {
                    query: Arc::clone(&plan.label),
                });
            }
            return Ok(id);
        }

        let mut inputs = Vec::with_capacity(plan.inputs.len());
        for input in &plan.inputs {
            inputs.push(self.ensure(input)?);
        }
        let mut replays: Vec<AnySet> = Vec::with_capacity(inputs.len());
        for input in &inputs {
            let slot = self
                .nodes
                .get(input)
                .ok_or(ReteError::InternalCorruption("input producer missing"))?;
            replays.push(slot.operator.replay());
        }

        let mut operator = (plan.build)(Arc::clone(&plan.label));
        {
            let sets: Vec<Option<AnySetRef<'_>>> =
                replays.iter().map(|set| Some(set.as_ref())).collect();
            let empty = Novelty::new();
            let mut cx = StepCx::new(self.snapshot.as_ref(), &empty, &mut self.next_match);
            operator.step(&mut cx, &sets)?;
        }

        let id = NodeId(self.next_node);
        self.next_node += 1;
        for input in &inputs {
            if let Some(slot) = self.nodes.get_mut(input) {
                slot.consumers += 1;
            }
        }
        debug!(
            producer = id.0,
            query = %plan.label,
            live = operator.live_count(),
            "producer created"
        );
        self.nodes.insert(
            id,
            NodeSlot {
                key: plan.key,
                label: Arc::clone(&plan.label),
                output: plan.output,
                inputs,
                consumers: 0,
                operator,
            },
        );
        self.by_key.insert(plan.key, id);
        Ok(id)
    }

    /// Drops one consumer reference, disposing producers that reach zero.
    fn release(&mut self, id: NodeId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let Some(slot) = self.nodes.get_mut(&id) else {
                continue;
            };
            slot.consumers = slot.consumers.saturating_sub(1);
            if slot.consumers > 0 {
                continue;
            }
            if let Some(mut slot) = self.nodes.remove(&id) {
                self.by_key.remove(&slot.key);
                slot.operator.dispose(&Disposal::Teardown);
                debug!(producer = id.0, query = %slot.label, "producer disposed");
                pending.extend(slot.inputs.iter().copied());
            }
        }
    }

    fn propagate(&mut self, change: &Change) -> Result<(), ReteError> {
        let mut emitted: BTreeMap<NodeId, AnySet> = BTreeMap::new();
        let order: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in order {
            let Some(slot) = self.nodes.get_mut(&id) else {
                continue;
            };
            let produced = {
                let sets: Vec<Option<AnySetRef<'_>>> = slot
                    .inputs
                    .iter()
                    .map(|input| emitted.get(input).map(|set| set.as_ref()))
                    .collect();
                let mut cx =
                    StepCx::new(change.after.as_ref(), &change.novelty, &mut self.next_match);
                slot.operator.step(&mut cx, &sets)?
            };
            if let Some(set) = produced {
                emitted.insert(id, set);
            }
        }
        self.snapshot = Arc::clone(&change.after);

        let mut delivered = 0_usize;
        for observer in self.observers.values_mut() {
            if let Some(set) = emitted.get(&observer.node) {
                if !observer.sink.deliver(set.as_ref()) {
                    return Err(ReteError::TypeMismatch {
                        query: Arc::clone(&observer.label),
                    });
                }
                delivered += 1;
            }
        }
        self.prune_observers();
        debug!(
            timestamp = %self.timestamp(),
            datoms = change.novelty.len(),
            changed = emitted.len(),
            delivered,
            "change propagated"
        );
        Ok(())
    }

    /// Removes observers whose dependencies were invalidated.
    fn prune_observers(&mut self) {
        let stale: Vec<ObserverId> = self
            .observers
            .iter()
            .filter(|(_, observer)| observer.dependencies.iter().any(|dep| !dep.is_valid()))
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.remove_observer(id);
        }
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        for slot in self.nodes.values_mut() {
            slot.operator.dispose(&Disposal::Teardown);
        }
    }
}

