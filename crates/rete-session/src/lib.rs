// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! rete-session: the asynchronous side of the Rete engine.
//!
//! A [`Session`] runs one coordinator task per [`rete_core::Network`] on
//! tokio. Consumers subscribe through it, pin work to matches with
//! [`MatchScope::with_match`] and commit through the transactional
//! interceptor ([`MatchScope::transact`]), which refuses writes that would
//! invalidate the matches the scope depends on.
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

/// Session configuration and its storage port.
pub mod config;
/// Filesystem adapter for [`config::ConfigStore`].
pub mod config_fs;
mod coordinator;
mod error;
mod scope;
mod session;
mod transact;
mod with_match;

pub use config::{ConfigError, ConfigService, ConfigStore, SessionConfig};
pub use config_fs::FsConfigStore;
pub use coordinator::Progress;
pub use error::SessionError;
pub use scope::{first_invalidation, ContextMatches, MatchScope};
pub use session::{ObserverHandle, Session, Subscription};
pub use transact::Committed;
pub use with_match::WithMatchResult;
