// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Running work pinned to matches.
//!
//! [`MatchScope::with_match`] polls its body and the invalidation signals of
//! the match (and everything it was derived from) together. Whichever
//! resolves first decides the outcome; when an invalidation wins, the body
//! future is dropped at its current suspension point.
use std::collections::BTreeMap;
use std::future::Future;

use rete_core::{
    AtMostOne, Cardinality, Data, InvalidationReason, Match, MatchHandle, MatchId, Query,
    TokenSet, UnsatisfiedMatch,
};
use tracing::{debug, debug_span, Instrument};

use crate::error::SessionError;
use crate::scope::{first_invalidation, MatchScope};

/// Outcome of work pinned to one or more matches.
#[must_use]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WithMatchResult<T> {
    /// The body finished while every match was still valid.
    Success(T),
    /// A match was invalidated first; the body was cancelled.
    Failure(InvalidationReason),
}

impl<T> WithMatchResult<T> {
    /// Returns true for [`WithMatchResult::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The invalidation that cancelled the body, if any.
    pub fn failure(&self) -> Option<&InvalidationReason> {
        match self {
            Self::Success(_) => None,
            Self::Failure(reason) => Some(reason),
        }
    }

    /// Maps the success value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> WithMatchResult<U> {
        match self {
            Self::Success(value) => WithMatchResult::Success(f(value)),
            Self::Failure(reason) => WithMatchResult::Failure(reason),
        }
    }

    /// Chains another pinned computation on success.
    pub fn and_then<U>(self, f: impl FnOnce(T) -> WithMatchResult<U>) -> WithMatchResult<U> {
        match self {
            Self::Success(value) => f(value),
            Self::Failure(reason) => WithMatchResult::Failure(reason),
        }
    }

    /// The success value, discarding a failure.
    pub fn ok(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            Self::Failure(_) => None,
        }
    }

    /// The success value, or the invalidation as an error for `?`.
    ///
    /// # Errors
    ///
    /// [`UnsatisfiedMatch`] carrying the failure reason.
    pub fn into_result(self) -> Result<T, UnsatisfiedMatch> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(reason) => Err(UnsatisfiedMatch::new(reason)),
        }
    }
}

impl<T> From<WithMatchResult<T>> for Result<T, UnsatisfiedMatch> {
    fn from(result: WithMatchResult<T>) -> Self {
        result.into_result()
    }
}

fn absorb<T>(live: &mut BTreeMap<MatchId, Match<T>>, set: TokenSet<T>) {
    for retracted in set.retracted {
        live.remove(&retracted.id());
    }
    for asserted in set.asserted {
        live.insert(asserted.id(), asserted);
    }
}

impl MatchScope {
    /// Runs `body` in a child scope that depends on `matched`.
    ///
    /// Returns [`WithMatchResult::Failure`] as soon as `matched` or any
    /// match it was derived from is invalidated, dropping the body. An
    /// invalidation of the parent scope's context cancels the body too.
    pub async fn with_match<T, R, F, Fut>(&self, matched: &Match<T>, body: F) -> WithMatchResult<R>
    where
        T: Sync,
        F: FnOnce(Self) -> Fut + Send,
        Fut: Future<Output = R> + Send,
    {
        self.with_matches(std::slice::from_ref(matched.handle()), body)
            .await
    }

    /// [`MatchScope::with_match`] over several matches; the first
    /// invalidation wins.
    pub async fn with_matches<R, F, Fut>(&self, handles: &[MatchHandle], body: F) -> WithMatchResult<R>
    where
        F: FnOnce(Self) -> Fut + Send,
        Fut: Future<Output = R> + Send,
    {
        let child = self.depending_on(handles);
        let span = debug_span!(
            "with_match",
            tag = child.tag().unwrap_or_default(),
            matches = handles.len(),
            context = child.context().len()
        );
        let invalidation = first_invalidation(child.context().iter());
        tokio::select! {
            biased;
            reason = invalidation => {
                debug!(%reason, tag = child.tag().unwrap_or_default(), "match invalidated, body cancelled");
                WithMatchResult::Failure(reason)
            }
            value = body(child.clone()).instrument(span) => WithMatchResult::Success(value),
        }
    }

    /// Runs `body` against the current match of a single-valued query.
    ///
    /// Fails with [`InvalidationReason::Absent`] if the query holds no match
    /// right now, and is cancelled if that match is retracted.
    pub async fn with_current_match<T, C, R, F, Fut>(&self, query: &Query<T, C>, body: F) -> WithMatchResult<R>
    where
        T: Data,
        C: AtMostOne,
        F: FnOnce(Match<T>, Self) -> Fut + Send,
        Fut: Future<Output = R> + Send,
    {
        let mut subscription = match self.subscribe(query).await {
            Ok(subscription) => subscription,
            Err(err) => return WithMatchResult::Failure(err.into_reason()),
        };
        let Some(replay) = subscription.next().await else {
            return WithMatchResult::Failure(self.ended_error().into_reason());
        };
        let Some(current) = replay.asserted.into_iter().next() else {
            return WithMatchResult::Failure(InvalidationReason::Absent);
        };
        let pinned = current.clone();
        let result = self.with_match(&current, move |scope| body(pinned, scope)).await;
        // The producer must stay observed until the body is done.
        drop(subscription);
        result
    }

    /// Waits for the query's first match, then runs `body` against it.
    pub async fn with_first_match<T, C, R, F, Fut>(&self, query: &Query<T, C>, body: F) -> WithMatchResult<R>
    where
        T: Data,
        C: Cardinality,
        F: FnOnce(Match<T>, Self) -> Fut + Send,
        Fut: Future<Output = R> + Send,
    {
        let mut subscription = match self.subscribe(query).await {
            Ok(subscription) => subscription,
            Err(err) => return WithMatchResult::Failure(err.into_reason()),
        };
        let first = loop {
            let Some(set) = subscription.next().await else {
                return WithMatchResult::Failure(self.ended_error().into_reason());
            };
            if let Some(first) = set.asserted.into_iter().find(Match::is_valid) {
                break first;
            }
        };
        let pinned = first.clone();
        let result = self.with_match(&first, move |scope| body(pinned, scope)).await;
        drop(subscription);
        result
    }

    /// Runs `body` against some live match of `query`, starting over with
    /// another match whenever the current one is invalidated mid-flight.
    ///
    /// Waits while the query is empty. Returns once a body runs to
    /// completion under a match that stayed valid throughout.
    ///
    /// # Errors
    ///
    /// [`SessionError::Poisoned`] if the session is poisoned,
    /// [`SessionError::Unsatisfied`] if this scope's own context is
    /// invalidated.
    pub async fn retry_with_match<T, C, R, F, Fut>(&self, query: &Query<T, C>, mut body: F) -> Result<R, SessionError>
    where
        T: Data,
        C: Cardinality,
        F: FnMut(Match<T>, Self) -> Fut + Send,
        Fut: Future<Output = R> + Send,
    {
        let mut subscription = self.subscribe(query).await?;
        let mut live: BTreeMap<MatchId, Match<T>> = BTreeMap::new();
        let mut attempts = 0_u32;
        loop {
            while let Some(set) = subscription.try_next() {
                absorb(&mut live, set);
            }
            let Some(candidate) = live.values().find(|candidate| candidate.is_valid()).cloned() else {
                match subscription.next().await {
                    Some(set) => {
                        absorb(&mut live, set);
                        continue;
                    }
                    None => return Err(self.ended_error()),
                }
            };
            attempts += 1;
            let pinned = candidate.clone();
            let attempt = &mut body;
            match self.with_match(&candidate, move |scope| attempt(pinned, scope)).await {
                WithMatchResult::Success(value) => return Ok(value),
                WithMatchResult::Failure(InvalidationReason::Poisoned(err)) => {
                    return Err(SessionError::Poisoned(err));
                }
                WithMatchResult::Failure(reason) => {
                    if let Some(own) = self.context().invalidation() {
                        return Err(UnsatisfiedMatch::new(own).into());
                    }
                    debug!(%reason, attempts, "match invalidated, retrying with the next one");
                    live.remove(&candidate.id());
                }
            }
        }
    }
}
