// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Match scopes: the explicit context a logical task carries.
//!
//! A [`MatchScope`] names the session a task runs against and the matches it
//! depends on. Child scopes extend the parent's [`ContextMatches`] without
//! changing it, so siblings never see each other's dependencies.
use std::sync::Arc;

use futures::future::{select_all, BoxFuture, FutureExt};
use rete_core::{Cardinality, Data, InvalidationReason, MatchHandle, Query, Timestamp};

use crate::error::SessionError;
use crate::session::{Session, Subscription};

struct Node {
    handle: MatchHandle,
    next: Option<Arc<Node>>,
}

/// Append-only, structurally shared list of the matches a task depends on.
///
/// Adding a handle returns a new list; the original is untouched.
#[derive(Clone, Default)]
pub struct ContextMatches {
    head: Option<Arc<Node>>,
    len: usize,
}

impl ContextMatches {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct handles.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the context holds no handles.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handles, most recently added first.
    pub fn iter(&self) -> impl Iterator<Item = &MatchHandle> + '_ {
        std::iter::successors(self.head.as_deref(), |node| node.next.as_deref())
            .map(|node| &node.handle)
    }

    /// Returns true if `handle` is already in the context.
    pub fn contains(&self, handle: &MatchHandle) -> bool {
        self.iter().any(|held| held == handle)
    }

    /// The context with `handle` appended (unchanged if already present).
    #[must_use]
    pub fn with(&self, handle: &MatchHandle) -> Self {
        if self.contains(handle) {
            return self.clone();
        }
        Self {
            head: Some(Arc::new(Node {
                handle: handle.clone(),
                next: self.head.clone(),
            })),
            len: self.len + 1,
        }
    }

    /// The context with every handle and its origin chain appended.
    #[must_use]
    pub fn extend<'a>(&self, handles: impl IntoIterator<Item = &'a MatchHandle>) -> Self {
        let mut context = self.clone();
        for handle in handles {
            for link in handle.lineage() {
                context = context.with(&link);
            }
        }
        context
    }

    /// First invalidation among the held handles, if any.
    pub fn invalidation(&self) -> Option<InvalidationReason> {
        self.iter().find_map(MatchHandle::invalidation)
    }
}

impl core::fmt::Debug for ContextMatches {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.iter().map(MatchHandle::id))
            .finish()
    }
}

/// Resolves with the reason of whichever handle (or origin) is invalidated
/// first. Never resolves for an empty input.
pub fn first_invalidation<'a>(
    handles: impl IntoIterator<Item = &'a MatchHandle>,
) -> BoxFuture<'static, InvalidationReason> {
    let mut watched: Vec<MatchHandle> = Vec::new();
    for handle in handles {
        for link in handle.lineage() {
            if !watched.contains(&link) {
                watched.push(link);
            }
        }
    }
    let waiters: Vec<BoxFuture<'static, InvalidationReason>> = watched
        .iter()
        .map(|handle| handle.invalidated().boxed())
        .collect();
    race(waiters).boxed()
}

async fn race(waiters: Vec<BoxFuture<'static, InvalidationReason>>) -> InvalidationReason {
    if waiters.is_empty() {
        return std::future::pending().await;
    }
    let (reason, _, _) = select_all(waiters).await;
    reason
}

/// Session plus the matches the current task depends on.
///
/// Every subscription made through a scope depends on its context matches,
/// and [`MatchScope::transact`] validates them before committing.
#[derive(Clone, Debug)]
pub struct MatchScope {
    session: Session,
    context: ContextMatches,
    tag: Option<Arc<str>>,
}

impl MatchScope {
    pub(crate) fn new(session: Session) -> Self {
        Self {
            session,
            context: ContextMatches::new(),
            tag: None,
        }
    }

    /// The session this scope runs against.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Matches this scope depends on.
    pub fn context(&self) -> &ContextMatches {
        &self.context
    }

    /// Diagnostic tag, if one was set.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Same scope with a diagnostic tag. Children inherit it.
    #[must_use]
    pub fn tagged(&self, tag: impl Into<Arc<str>>) -> Self {
        Self {
            tag: Some(tag.into()),
            ..self.clone()
        }
    }

    /// Child scope that additionally depends on `handles`.
    #[must_use]
    pub fn depending_on<'a>(&self, handles: impl IntoIterator<Item = &'a MatchHandle>) -> Self {
        Self {
            context: self.context.extend(handles),
            ..self.clone()
        }
    }

    /// Returns true once any context match is invalid.
    pub fn is_cancelled(&self) -> bool {
        self.context.invalidation().is_some()
    }

    /// Resolves when the first context match is invalidated. Never resolves
    /// for a root scope.
    pub fn cancelled(&self) -> BoxFuture<'static, InvalidationReason> {
        first_invalidation(self.context.iter())
    }

    /// [`Session::observe`] with the context matches as dependencies.
    ///
    /// # Errors
    ///
    /// Same as [`Session::observe_with`].
    pub async fn observe<T, C>(
        &self,
        query: &Query<T, C>,
        start: Timestamp,
    ) -> Result<Subscription<T>, SessionError>
    where
        T: Data,
        C: Cardinality,
    {
        self.session
            .observe(query, start, self.context.iter().cloned().collect())
            .await
    }

    /// [`Session::subscribe`] with the context matches as dependencies.
    ///
    /// # Errors
    ///
    /// Same as [`Session::observe_with`].
    pub async fn subscribe<T, C>(&self, query: &Query<T, C>) -> Result<Subscription<T>, SessionError>
    where
        T: Data,
        C: Cardinality,
    {
        self.observe(query, self.session.database().timestamp()).await
    }

    /// Why this scope can no longer make progress: its own cancellation if
    /// any, otherwise the session's state.
    pub(crate) fn ended_error(&self) -> SessionError {
        self.context.invalidation().map_or_else(
            || self.session.closed_error(),
            |reason| SessionError::Unsatisfied(rete_core::UnsatisfiedMatch::new(reason)),
        )
    }
}
