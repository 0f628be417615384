// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Session error types.
use rete_core::{InvalidationReason, ObserveError, ReteError, UnsatisfiedMatch};
use thiserror::Error;

/// Errors returned by session operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session's network is poisoned; the cause is terminal.
    #[error("session poisoned: {0}")]
    Poisoned(ReteError),
    /// A match the operation depended on is no longer valid.
    #[error(transparent)]
    Unsatisfied(#[from] UnsatisfiedMatch),
    /// The coordinator task is gone.
    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// The error as a match invalidation, for APIs that report failures as
    /// [`InvalidationReason`]s.
    pub fn into_reason(self) -> InvalidationReason {
        match self {
            Self::Poisoned(err) => InvalidationReason::Poisoned(err),
            Self::Unsatisfied(unsatisfied) => unsatisfied.reason().clone(),
            Self::Closed => InvalidationReason::Poisoned(ReteError::Shutdown),
        }
    }
}

impl From<ReteError> for SessionError {
    fn from(err: ReteError) -> Self {
        Self::Poisoned(err)
    }
}

impl From<ObserveError> for SessionError {
    fn from(err: ObserveError) -> Self {
        match err {
            ObserveError::Unsatisfied(unsatisfied) => Self::Unsatisfied(unsatisfied),
            ObserveError::Rete(err) => Self::Poisoned(err),
        }
    }
}
