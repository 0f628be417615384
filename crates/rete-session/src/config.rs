// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Session configuration and its storage port.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Where session configs live: opaque byte blobs under a string key.
pub trait ConfigStore {
    /// Reads the blob stored under `key`; [`ConfigError::NotFound`] if none.
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Replaces the blob stored under `key`.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Failure to read or write a stored config.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Nothing stored under the key.
    #[error("config key not found")]
    NotFound,
    /// The backing store failed.
    #[error("config store i/o: {0}")]
    Io(#[from] std::io::Error),
    /// The blob is not valid JSON for the requested type.
    #[error("config json: {0}")]
    Serde(#[from] serde_json::Error),
    /// Store-specific failure.
    #[error("config store: {0}")]
    Other(String),
}

/// JSON codec in front of a [`ConfigStore`].
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Wraps `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Unwraps the store.
    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S: ConfigStore> ConfigService<S> {
    /// Decodes the value under `key`. Missing and empty blobs read as `None`.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        let raw = match self.store.load_raw(key) {
            Err(ConfigError::NotFound) => return Ok(None),
            other => other?,
        };
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Encodes `value` as pretty JSON under `key`.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ConfigError> {
        let raw = serde_json::to_vec_pretty(value)?;
        self.store.save_raw(key, &raw)
    }
}

/// Tunables of one session.
///
/// Missing fields take their defaults, so older stored configs keep loading.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Diagnostic label attached to the coordinator's span.
    pub label: String,
    /// Let panics in combinator closures propagate instead of poisoning.
    pub strict: bool,
    /// Maximum number of queued changes merged into one propagation.
    pub max_coalesce: usize,
    /// Interceptor spins between two "still waiting" warnings.
    pub spin_warn_after: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            label: "rete".to_owned(),
            strict: false,
            max_coalesce: 64,
            spin_warn_after: 1024,
        }
    }
}

impl SessionConfig {
    /// Key the config is stored under.
    pub const KEY: &'static str = "rete_session";

    /// Loads the stored config, falling back to defaults when absent.
    ///
    /// # Errors
    ///
    /// Fails if the store fails or the stored blob does not parse.
    pub fn load<S: ConfigStore>(service: &ConfigService<S>) -> Result<Self, ConfigError> {
        Ok(service.load(Self::KEY)?.unwrap_or_default())
    }

    /// Persists this config.
    ///
    /// # Errors
    ///
    /// Fails if serialization or the store fails.
    pub fn save<S: ConfigStore>(&self, service: &ConfigService<S>) -> Result<(), ConfigError> {
        service.save(Self::KEY, self)
    }

    /// Same config with another label.
    #[must_use]
    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Same config with strict mode set.
    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let parsed: SessionConfig = serde_json::from_str(r#"{"strict": true}"#).unwrap();
        assert!(parsed.strict);
        assert_eq!(parsed.max_coalesce, SessionConfig::default().max_coalesce);
        assert_eq!(parsed.label, "rete");
    }
}
