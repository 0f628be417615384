// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Membership-change events.
use crate::matches::Match;

/// One membership change: `matched` entered (`added`) or left the result set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token<T> {
    /// True for an assertion, false for a retraction.
    pub added: bool,
    /// The match that entered or left.
    pub matched: Match<T>,
}

impl<T> Token<T> {
    /// An assertion token.
    pub fn assert(matched: Match<T>) -> Self {
        Self {
            added: true,
            matched,
        }
    }

    /// A retraction token.
    pub fn retract(matched: Match<T>) -> Self {
        Self {
            added: false,
            matched,
        }
    }

    /// The value carried by the match.
    pub fn value(&self) -> &T {
        self.matched.value()
    }
}

/// Every membership change one producer made while processing one change.
///
/// Within a set, a match id appears at most once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenSet<T> {
    /// Matches that entered the result set, in match-id order.
    pub asserted: Vec<Match<T>>,
    /// Matches that left the result set, in match-id order.
    pub retracted: Vec<Match<T>>,
}

impl<T> Default for TokenSet<T> {
    fn default() -> Self {
        Self {
            asserted: Vec::new(),
            retracted: Vec::new(),
        }
    }
}

impl<T> TokenSet<T> {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.asserted.is_empty() && self.retracted.is_empty()
    }

    /// Total number of tokens.
    pub fn len(&self) -> usize {
        self.asserted.len() + self.retracted.len()
    }

    /// Values of the asserted matches.
    pub fn asserted_values(&self) -> impl Iterator<Item = &T> + '_ {
        self.asserted.iter().map(Match::value)
    }

    /// Values of the retracted matches.
    pub fn retracted_values(&self) -> impl Iterator<Item = &T> + '_ {
        self.retracted.iter().map(Match::value)
    }

    pub(crate) fn sort(&mut self) {
        self.asserted.sort_by_key(Match::id);
        self.retracted.sort_by_key(Match::id);
    }
}

impl<T: Clone> TokenSet<T> {
    /// The set as individual tokens: retractions first, then assertions.
    pub fn tokens(&self) -> impl Iterator<Item = Token<T>> + '_ {
        self.retracted
            .iter()
            .cloned()
            .map(Token::retract)
            .chain(self.asserted.iter().cloned().map(Token::assert))
    }
}
