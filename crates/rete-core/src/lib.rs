// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! rete-core: incremental query propagation over versioned fact snapshots.
//!
//! Queries are described with pure combinators ([`Query`]) and evaluated by a
//! [`Network`]: an arena of shared producers that turns every database
//! [`Change`] into at most one [`TokenSet`] per observer. The network is
//! synchronous and runtime-free; the asynchronous coordinator, match scopes and
//! the transactional interceptor live in `rete-session`.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod change;
mod error;
mod ident;
mod matches;
mod network;
mod operator;
mod query;
mod snapshot;
/// Reference in-memory fact store used as the snapshot source.
pub mod store;
mod token;
mod value;

/// Database deltas observed by the network.
pub use change::{Change, ChangeMeta, Novelty};
/// Engine and subscription errors.
pub use error::{ObserveError, ReteError};
/// Identifiers and timestamps.
pub use ident::{make_intern_key, Attribute, EntityId, Hash, MatchId, ObserverId, QueryKey, Timestamp};
/// Matches, validity signals and validation.
pub use matches::{
    validate_all, BoundQuery, InvalidationReason, Match, MatchHandle, UnsatisfiedMatch,
    ValidationResult, Validity,
};
/// Producer arena and coordinator core.
pub use network::Network;
/// Query descriptions and cardinality markers.
pub use query::{AtMostOne, Cardinality, Data, Many, Maybe, Query, Single};
/// Snapshot boundary and read tracking.
pub use snapshot::{DbView, Pattern, Snapshot, SnapshotRef};
/// Membership-change events.
pub use token::{Token, TokenSet};
/// Fact values.
pub use value::{Datom, Value};
