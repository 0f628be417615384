// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Query descriptions.
//!
//! A [`Query`] is an inert description: a plan node naming its operator and
//! its input queries. Nothing is evaluated until an observer subscribes to it
//! through a [`crate::Network`], which instantiates one producer per distinct
//! [`QueryKey`] and shares it among every observer of an equal key.
//!
//! Queries carry a cardinality marker. [`Many`] is an unrestricted bag,
//! [`Maybe`] holds at most one match and [`Single`] always holds exactly one.
//! The marker is tracked at the type level so single-match operations such as
//! `with_current_match` only accept queries that cannot hold two matches.
use std::any::TypeId;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::change::Novelty;
use crate::error::ReteError;
use crate::ident::{make_intern_key, Attribute, EntityId, QueryKey};
use crate::matches::Match;
use crate::operator::{
    AnySet, AnySetRef, BoundOp, DistinctOp, Disposal, ErasedOperator, FlatMapFn, FlatMapOp,
    FoldFn, JoinOp, KeyFn, Operator, OperatorNode, ReductionsOp, SingleOp, StepCx, UnionOp,
    UnitOp,
};
use crate::snapshot::{DbView, Snapshot};
use crate::token::{Token, TokenSet};
use crate::value::Value;

/// Bounds every value carried by a query.
///
/// Values are compared to detect changes and hashed for distinct and join
/// indexes, so they must be cheap to clone and thread-safe.
pub trait Data: Clone + Eq + Hash + core::fmt::Debug + Send + Sync + 'static {}

impl<T> Data for T where T: Clone + Eq + Hash + core::fmt::Debug + Send + Sync + 'static {}

/// Type-level cardinality of a query.
pub trait Cardinality: Send + Sync + 'static {
    /// Cardinality after a filter.
    type Filtered: Cardinality;
}

/// Cardinalities that never hold two matches at once.
pub trait AtMostOne: Cardinality {}

/// Any number of matches.
#[derive(Debug)]
pub enum Many {}

/// Zero or one match.
#[derive(Debug)]
pub enum Maybe {}

/// Exactly one match.
#[derive(Debug)]
pub enum Single {}

impl Cardinality for Many {
    type Filtered = Self;
}

impl Cardinality for Maybe {
    type Filtered = Self;
}

impl Cardinality for Single {
    type Filtered = Maybe;
}

impl AtMostOne for Maybe {}
impl AtMostOne for Single {}

pub(crate) type BuildFn = Arc<dyn Fn(Arc<str>) -> Box<dyn ErasedOperator> + Send + Sync>;

pub(crate) struct Plan {
    pub(crate) key: QueryKey,
    pub(crate) label: Arc<str>,
    pub(crate) inputs: Vec<Arc<Plan>>,
    pub(crate) output: TypeId,
    pub(crate) build: BuildFn,
}

impl Plan {
    /// Evaluates the plan from scratch against `snapshot`.
    ///
    /// Every operator of the plan is instantiated privately, fed its inputs'
    /// full contents and disposed again; no network producer is touched. Cost
    /// is that of building the whole subgraph, so it is reserved for
    /// re-checks that cannot be answered per match.
    pub(crate) fn evaluate<T: Data>(&self, snapshot: &dyn Snapshot) -> Result<TokenSet<T>, ReteError> {
        let mut next_match = 1;
        let contents = self.evaluate_erased(snapshot, &mut next_match)?;
        contents
            .as_ref()
            .downcast_ref::<TokenSet<T>>()
            .cloned()
            .ok_or_else(|| ReteError::TypeMismatch {
                query: Arc::clone(&self.label),
            })
    }

    fn evaluate_erased(&self, snapshot: &dyn Snapshot, next_match: &mut u64) -> Result<AnySet, ReteError> {
        let mut inputs: Vec<AnySet> = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            inputs.push(input.evaluate_erased(snapshot, next_match)?);
        }
        let sets: Vec<Option<AnySetRef<'_>>> = inputs.iter().map(|set| Some(set.as_ref())).collect();
        let mut operator = (self.build)(Arc::clone(&self.label));
        let empty = Novelty::new();
        let stepped = {
            let mut cx = StepCx::new(snapshot, &empty, next_match);
            operator.step(&mut cx, &sets)
        };
        let contents = operator.replay();
        operator.dispose(&Disposal::Teardown);
        stepped.map(|_| contents)
    }
}

/// Description of a derived result set with values of type `T`.
pub struct Query<T, C = Many> {
    plan: Arc<Plan>,
    marker: PhantomData<fn() -> (T, C)>,
}

impl<T, C> Clone for Query<T, C> {
    fn clone(&self) -> Self {
        Self {
            plan: Arc::clone(&self.plan),
            marker: PhantomData,
        }
    }
}

impl<T, C> core::fmt::Debug for Query<T, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Query")
            .field("label", &self.plan.label)
            .field("key", &self.plan.key)
            .finish_non_exhaustive()
    }
}

fn plan<U, C, O, F>(label: Arc<str>, key: QueryKey, inputs: Vec<Arc<Plan>>, make: F) -> Query<U, C>
where
    U: Data,
    C: Cardinality,
    O: Operator<Out = U>,
    F: Fn() -> O + Send + Sync + 'static,
{
    let build: BuildFn = Arc::new(move |label: Arc<str>| OperatorNode::boxed(label, make()));
    Query {
        plan: Arc::new(Plan {
            key,
            label,
            inputs,
            output: TypeId::of::<U>(),
            build,
        }),
        marker: PhantomData,
    }
}

impl Query<(), Single> {
    /// The root query: a single `()` match that never changes.
    pub fn unit() -> Self {
        plan(Arc::from("unit"), QueryKey::anonymous(), Vec::new(), UnitOp::default)
    }
}

impl Query<EntityId, Many> {
    /// Entities holding `value` under `attribute`.
    pub fn entities_with(attribute: Attribute, value: impl Into<Value>) -> Self {
        let value = value.into();
        let label = format!("{attribute}={value}");
        Query::unit()
            .flat_map(move |db, ()| db.entities(attribute, value.clone()))
            .named(label)
    }
}

impl<T: Data> Query<T, Maybe> {
    pub(crate) fn bound(source: Match<T>) -> Self {
        let key = QueryKey::Bound(source.id());
        let label = Arc::from(format!("bound({})", source.id()));
        plan(label, key, Vec::new(), move || BoundOp::new(source.clone()))
    }
}

impl<T: Data, C: Cardinality> Query<T, C> {
    pub(crate) fn plan(&self) -> &Arc<Plan> {
        &self.plan
    }

    /// Sharing key of this query's producer.
    pub fn key(&self) -> QueryKey {
        self.plan.key
    }

    /// Diagnostic label.
    pub fn label(&self) -> &str {
        &self.plan.label
    }

    /// Same query under another diagnostic label.
    pub fn named(&self, label: impl Into<String>) -> Self {
        let Plan {
            key,
            inputs,
            output,
            build,
            ..
        } = &*self.plan;
        Self {
            plan: Arc::new(Plan {
                key: *key,
                label: Arc::from(label.into()),
                inputs: inputs.clone(),
                output: *output,
                build: Arc::clone(build),
            }),
            marker: PhantomData,
        }
    }

    /// Same query under an explicit sharing key.
    ///
    /// Every query interned with an equal key and value type shares one
    /// producer, however it was constructed. Callers must only intern queries
    /// that compute the same result.
    pub fn intern<K: Hash + ?Sized>(&self, key: &K) -> Self {
        let Plan {
            label,
            inputs,
            output,
            build,
            ..
        } = &*self.plan;
        Self {
            plan: Arc::new(Plan {
                key: make_intern_key("query", TypeId::of::<T>(), key),
                label: Arc::clone(label),
                inputs: inputs.clone(),
                output: *output,
                build: Arc::clone(build),
            }),
            marker: PhantomData,
        }
    }

    fn child<U: Data, C2: Cardinality, O, F>(&self, op: &str, inputs: Vec<Arc<Plan>>, make: F) -> Query<U, C2>
    where
        O: Operator<Out = U>,
        F: Fn() -> O + Send + Sync + 'static,
    {
        let label = Arc::from(format!("{}.{op}", self.plan.label));
        plan(label, QueryKey::anonymous(), inputs, make)
    }

    fn expand<U: Data, C2: Cardinality>(&self, op: &str, f: FlatMapFn<T, U>) -> Query<U, C2> {
        self.child(op, vec![Arc::clone(&self.plan)], move || FlatMapOp::new(Arc::clone(&f)))
    }

    /// Transforms each value. Cardinality is preserved.
    pub fn map<U, F>(&self, f: F) -> Query<U, C>
    where
        U: Data,
        F: Fn(&DbView<'_>, &T) -> U + Send + Sync + 'static,
    {
        self.expand("map", flat_map_fn(move |db, m: &Match<T>| vec![f(db, m.value())]))
    }

    /// Transforms each match; the closure sees the match identity.
    pub fn map_match<U, F>(&self, f: F) -> Query<U, C>
    where
        U: Data,
        F: Fn(&DbView<'_>, &Match<T>) -> U + Send + Sync + 'static,
    {
        self.expand("map_match", flat_map_fn(move |db, m: &Match<T>| vec![f(db, m)]))
    }

    /// Expands each value into zero or more values.
    ///
    /// Duplicate values from one input collapse into one match.
    pub fn flat_map<U, I, F>(&self, f: F) -> Query<U, Many>
    where
        U: Data,
        I: IntoIterator<Item = U>,
        F: Fn(&DbView<'_>, &T) -> I + Send + Sync + 'static,
    {
        self.expand(
            "flat_map",
            flat_map_fn(move |db, m: &Match<T>| f(db, m.value()).into_iter().collect()),
        )
    }

    /// Keeps the values satisfying `predicate`.
    pub fn filter<F>(&self, predicate: F) -> Query<T, C::Filtered>
    where
        F: Fn(&DbView<'_>, &T) -> bool + Send + Sync + 'static,
    {
        self.expand(
            "filter",
            flat_map_fn(move |db, m: &Match<T>| {
                if predicate(db, m.value()) {
                    vec![m.value().clone()]
                } else {
                    Vec::new()
                }
            }),
        )
    }

    /// Collapses equal values into one match.
    pub fn distinct(&self) -> Self {
        let input = Arc::clone(&self.plan);
        self.child("distinct", vec![Arc::clone(&input)], move || {
            DistinctOp::new(Arc::clone(&input))
        })
    }

    /// Bag union with another query of the same value type.
    pub fn union<C2: Cardinality>(&self, other: &Query<T, C2>) -> Query<T, Many> {
        self.child(
            "union",
            vec![Arc::clone(&self.plan), Arc::clone(other.plan())],
            UnionOp::new,
        )
    }

    /// Every pair of values from `self` and `other`.
    pub fn product<U: Data, C2: Cardinality>(&self, other: &Query<U, C2>) -> Query<(T, U), Many> {
        self.join_on("product", other, Arc::new(|_: &T| ()), Arc::new(|_: &U| ()))
    }

    /// Pairs of values whose keys are equal.
    pub fn join<U, K, C2, LK, RK>(&self, other: &Query<U, C2>, left_key: LK, right_key: RK) -> Query<(T, U), Many>
    where
        U: Data,
        K: Data,
        C2: Cardinality,
        LK: Fn(&T) -> K + Send + Sync + 'static,
        RK: Fn(&U) -> K + Send + Sync + 'static,
    {
        self.join_on("join", other, Arc::new(left_key), Arc::new(right_key))
    }

    fn join_on<U: Data, K: Data, C2: Cardinality>(
        &self,
        op: &str,
        other: &Query<U, C2>,
        left_key: KeyFn<T, K>,
        right_key: KeyFn<U, K>,
    ) -> Query<(T, U), Many> {
        self.child(
            op,
            vec![Arc::clone(&self.plan), Arc::clone(other.plan())],
            move || JoinOp::new(Arc::clone(&left_key), Arc::clone(&right_key)),
        )
    }

    /// Running fold of every token the query emits, starting from `seed`.
    ///
    /// The result always holds exactly one match: the current accumulator.
    /// Retractions are folded too, so `f` must undo an assertion when it sees
    /// the matching retraction.
    pub fn reductions<A, F>(&self, seed: A, f: F) -> Query<A, Single>
    where
        A: Data,
        F: Fn(&A, &Token<T>) -> A + Send + Sync + 'static,
    {
        let f: FoldFn<T, A> = Arc::new(f);
        let input = Arc::clone(&self.plan);
        self.child("reductions", vec![Arc::clone(&input)], move || {
            ReductionsOp::new(seed.clone(), Arc::clone(&f), Arc::clone(&input))
        })
    }

    /// Number of live matches.
    pub fn count(&self) -> Query<u64, Single> {
        self.reductions(0_u64, |n, token| {
            if token.added {
                n + 1
            } else {
                n.saturating_sub(1)
            }
        })
        .named(format!("{}.count", self.plan.label))
    }

    /// Restricts to at most one match; holding two poisons the network.
    pub fn single(&self) -> Query<T, Maybe> {
        let input = Arc::clone(&self.plan);
        self.child("single", vec![Arc::clone(&input)], move || SingleOp::new(Arc::clone(&input)))
    }
}

impl<C: Cardinality> Query<EntityId, C> {
    /// Values of `attribute` for each entity.
    pub fn attribute(&self, attribute: Attribute) -> Query<Value, Many> {
        self.flat_map(move |db, entity| db.values(*entity, attribute))
            .named(format!("{}.{attribute}", self.plan.label))
    }
}

impl<C: Cardinality> Query<i64, C> {
    /// Sum of the live values.
    pub fn sum(&self) -> Query<i64, Single> {
        self.reductions(0_i64, |acc, token| {
            if token.added {
                acc.wrapping_add(*token.value())
            } else {
                acc.wrapping_sub(*token.value())
            }
        })
        .named(format!("{}.sum", self.plan.label))
    }
}

/// Pins the closure to the higher-ranked signature of [`FlatMapFn`].
fn flat_map_fn<I, O, F>(f: F) -> FlatMapFn<I, O>
where
    F: Fn(&DbView<'_>, &Match<I>) -> Vec<O> + Send + Sync + 'static,
{
    Arc::new(f)
}
