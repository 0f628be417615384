// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Config store fake backed by a map.

use rete_session::{ConfigError, ConfigStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// [`ConfigStore`] that keeps blobs in memory.
///
/// Clones share state. Call counters and failure switches let tests check
/// how a session loads and persists its config.
///
/// # Example
///
/// ```
/// use rete_dry_tests::InMemoryConfigStore;
/// use rete_session::{ConfigService, SessionConfig};
///
/// let store = InMemoryConfigStore::new();
/// let service = ConfigService::new(store.clone());
///
/// SessionConfig::default().labeled("docs").save(&service).unwrap();
/// assert_eq!(SessionConfig::load(&service).unwrap().label, "docs");
/// assert_eq!(store.save_count(), 1);
/// assert_eq!(store.load_count(), 1);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryConfigStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    blobs: HashMap<String, Vec<u8>>,
    load_count: usize,
    save_count: usize,
    fail_on_load: bool,
    fail_on_save: bool,
}

impl InMemoryConfigStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-seeded with `data` under `key`.
    pub fn with_raw(key: &str, data: &[u8]) -> Self {
        let store = Self::new();
        store.lock().blobs.insert(key.to_owned(), data.to_vec());
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every later load fail (or succeed again).
    pub fn set_fail_on_load(&self, fail: bool) {
        self.lock().fail_on_load = fail;
    }

    /// Make every later save fail (or succeed again).
    pub fn set_fail_on_save(&self, fail: bool) {
        self.lock().fail_on_save = fail;
    }

    /// Number of `load_raw` calls, failed ones included.
    pub fn load_count(&self) -> usize {
        self.lock().load_count
    }

    /// Number of `save_raw` calls, failed ones included.
    pub fn save_count(&self) -> usize {
        self.lock().save_count
    }

    /// Raw blob stored under `key`, without counting a load.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().blobs.get(key).cloned()
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        let mut inner = self.lock();
        inner.load_count += 1;
        if inner.fail_on_load {
            return Err(ConfigError::Other("load switched off".into()));
        }
        inner.blobs.get(key).cloned().ok_or(ConfigError::NotFound)
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        let mut inner = self.lock();
        inner.save_count += 1;
        if inner.fail_on_save {
            return Err(ConfigError::Other("save switched off".into()));
        }
        inner.blobs.insert(key.to_owned(), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use rete_session::{ConfigService, SessionConfig};

    #[test]
    fn missing_key_loads_defaults() {
        let store = InMemoryConfigStore::new();
        let service = ConfigService::new(store.clone());
        assert_eq!(SessionConfig::load(&service).unwrap(), SessionConfig::default());
        assert_eq!(store.load_count(), 1);
    }

    #[test]
    fn partial_blob_keeps_remaining_defaults() {
        let blob = serde_json::to_vec(&serde_json::json!({ "max_coalesce": 4 })).unwrap();
        let store = InMemoryConfigStore::with_raw(SessionConfig::KEY, &blob);
        let loaded = SessionConfig::load(&ConfigService::new(store)).unwrap();
        assert_eq!(loaded.max_coalesce, 4);
        assert_eq!(loaded.spin_warn_after, SessionConfig::default().spin_warn_after);
    }

    #[test]
    fn save_failure_stores_nothing_but_counts() {
        let store = InMemoryConfigStore::new();
        store.set_fail_on_save(true);
        let service = ConfigService::new(store.clone());
        let err = SessionConfig::default().save(&service).unwrap_err();
        assert!(matches!(err, ConfigError::Other(_)));
        assert_eq!(store.save_count(), 1);
        assert!(store.raw(SessionConfig::KEY).is_none());
    }

    #[test]
    fn load_failure_surfaces() {
        let store = InMemoryConfigStore::new();
        store.set_fail_on_load(true);
        let err = SessionConfig::load(&ConfigService::new(store)).unwrap_err();
        assert!(matches!(err, ConfigError::Other(_)));
    }

    #[test]
    fn garbage_blob_is_a_serde_error() {
        let store = InMemoryConfigStore::with_raw(SessionConfig::KEY, b"not json");
        let err = SessionConfig::load(&ConfigService::new(store)).unwrap_err();
        assert!(matches!(err, ConfigError::Serde(_)));
    }
}
