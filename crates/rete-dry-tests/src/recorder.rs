// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Observer sink that records deliveries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rete_core::{Data, Match, MatchId, TokenSet};

struct Inner<T> {
    sets: Vec<TokenSet<T>>,
    live: BTreeMap<MatchId, Match<T>>,
    retired: BTreeSet<MatchId>,
    violations: Vec<String>,
}

/// Records every token set delivered to an observer.
///
/// Clones share state: hand [`Recorder::sink`] to the network or session and
/// keep the recorder to inspect what arrived. Besides the raw sets it keeps
/// the live result and flags token-balance violations: a match asserted while
/// live, asserted after its retraction, or retracted without being live.
pub struct Recorder<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Data> Default for Recorder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Data> Recorder<T> {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                sets: Vec::new(),
                live: BTreeMap::new(),
                retired: BTreeSet::new(),
                violations: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Callback to register as an observer.
    pub fn sink(&self) -> impl FnMut(TokenSet<T>) + Send + 'static {
        let recorder = self.clone();
        move |set| recorder.record(set)
    }

    /// Records one delivery.
    pub fn record(&self, set: TokenSet<T>) {
        let mut inner = self.lock();
        for retracted in &set.retracted {
            let id = retracted.id();
            if inner.live.remove(&id).is_none() {
                inner.violations.push(format!("{id} retracted while not live"));
            }
            inner.retired.insert(id);
        }
        for asserted in &set.asserted {
            let id = asserted.id();
            if inner.retired.contains(&id) {
                inner.violations.push(format!("{id} asserted after its retraction"));
            }
            if inner.live.insert(id, asserted.clone()).is_some() {
                inner.violations.push(format!("{id} asserted twice"));
            }
        }
        inner.sets.push(set);
    }

    /// Every delivered set, in delivery order.
    pub fn sets(&self) -> Vec<TokenSet<T>> {
        self.lock().sets.clone()
    }

    /// Number of deliveries, the initial replay included.
    pub fn deliveries(&self) -> usize {
        self.lock().sets.len()
    }

    /// The most recent delivery.
    pub fn last(&self) -> Option<TokenSet<T>> {
        self.lock().sets.last().cloned()
    }

    /// Matches currently in the result.
    pub fn live_matches(&self) -> Vec<Match<T>> {
        self.lock().live.values().cloned().collect()
    }

    /// Token-balance violations seen so far.
    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }
}

impl<T: Data + Ord> Recorder<T> {
    /// Values currently in the result, sorted.
    pub fn live_values(&self) -> Vec<T> {
        let mut values: Vec<T> = self
            .lock()
            .live
            .values()
            .map(|matched| matched.value().clone())
            .collect();
        values.sort();
        values
    }
}

impl<T> core::fmt::Debug for Recorder<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Recorder")
            .field("deliveries", &inner.sets.len())
            .field("live", &inner.live.len())
            .field("violations", &inner.violations.len())
            .finish()
    }
}

/// Values of `set`'s assertions and retractions, each sorted.
pub fn sorted_values<T: Clone + Ord>(set: &TokenSet<T>) -> (Vec<T>, Vec<T>) {
    let mut asserted: Vec<T> = set.asserted_values().cloned().collect();
    let mut retracted: Vec<T> = set.retracted_values().cloned().collect();
    asserted.sort();
    retracted.sort();
    (asserted, retracted)
}
