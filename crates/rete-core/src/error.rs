// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Engine error types.
use std::any::Any;
use std::sync::Arc;

use thiserror::Error;

use crate::ident::{MatchId, Timestamp};
use crate::matches::UnsatisfiedMatch;

/// Errors that poison a network.
///
/// Every variant is fatal to the network it occurs in: after the first one,
/// all producers are disposed, every outstanding match is invalidated with
/// [`crate::InvalidationReason::Poisoned`], and further requests fail with the
/// same error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReteError {
    /// A cardinality-restricted producer held more than one match.
    #[error("query `{query}` expected at most one match, found {count}")]
    MultipleMatches {
        /// Label of the offending query.
        query: Arc<str>,
        /// Number of live matches.
        count: usize,
    },
    /// An operator retracted a match it never asserted.
    #[error("operator `{operator}` retracted {match_id}, which is not live")]
    UnbalancedRetract {
        /// Label of the offending operator.
        operator: Arc<str>,
        /// Retracted match.
        match_id: MatchId,
    },
    /// An operator asserted a match that was already live.
    #[error("operator `{operator}` asserted {match_id} twice")]
    DuplicateAssert {
        /// Label of the offending operator.
        operator: Arc<str>,
        /// Asserted match.
        match_id: MatchId,
    },
    /// A shared producer does not carry the value type a query expects.
    #[error("producer for query `{query}` carries a different value type")]
    TypeMismatch {
        /// Label of the requesting query.
        query: Arc<str>,
    },
    /// A change did not start at the network's current timestamp.
    #[error("change starting at {found} does not follow {expected}")]
    NonContiguousChange {
        /// Timestamp the network was at.
        expected: Timestamp,
        /// Timestamp the change started at.
        found: Timestamp,
    },
    /// User code panicked during propagation.
    #[error("panic during propagation: {0}")]
    Panicked(Arc<str>),
    /// The coordinator was shut down.
    #[error("session shut down")]
    Shutdown,
    /// Internal invariant violated.
    #[error("internal corruption: {0}")]
    InternalCorruption(&'static str),
}

impl ReteError {
    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&'static str>()
            .map(|s| Arc::<str>::from(*s))
            .or_else(|| payload.downcast_ref::<String>().map(|s| Arc::from(s.as_str())))
            .unwrap_or_else(|| Arc::from("non-string panic payload"));
        Self::Panicked(message)
    }
}

/// Errors returned when registering an observer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObserveError {
    /// A dependency match was already invalid; the network is unaffected.
    #[error(transparent)]
    Unsatisfied(#[from] UnsatisfiedMatch),
    /// The network is (or just became) poisoned.
    #[error(transparent)]
    Rete(#[from] ReteError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_become_messages() {
        let static_payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(
            ReteError::from_panic(static_payload.as_ref()),
            ReteError::Panicked(Arc::from("boom"))
        );
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(
            ReteError::from_panic(owned.as_ref()),
            ReteError::Panicked(Arc::from("owned boom"))
        );
        let opaque: Box<dyn Any + Send> = Box::new(7u8);
        assert!(matches!(
            ReteError::from_panic(opaque.as_ref()),
            ReteError::Panicked(_)
        ));
    }
}
