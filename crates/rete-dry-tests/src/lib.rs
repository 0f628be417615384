// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared test doubles and fixtures for Rete crates.
#![forbid(unsafe_code)]
//!
//! # Modules
//!
//! - [`config`] - In-memory config store fake for testing without filesystem
//! - [`people`] - People/companies schema, seed helpers and common queries
//! - [`recorder`] - Observer sink recording deliveries and balance violations

pub mod config;
pub mod people;
pub mod recorder;

// Re-export commonly used items at crate root for convenience
pub use config::InMemoryConfigStore;
pub use people::{
    add_company, add_person, age_ints, ages, companies, employ, employments, people, seed_people,
    set_age, staff, AGE, COMPANY, EMPLOYER, NAME, PERSON, TYPE,
};
pub use recorder::{sorted_values, Recorder};

/// Installs a `tracing` fmt subscriber writing to the test harness.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
