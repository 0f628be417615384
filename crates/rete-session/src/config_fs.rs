// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Filesystem-backed [`ConfigStore`] under the platform config directory.

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::config::{ConfigError, ConfigStore};

/// Stores configs as JSON files, one per key.
#[derive(Clone, Debug)]
pub struct FsConfigStore {
    base: PathBuf,
}

impl FsConfigStore {
    /// Store under the platform config directory (`~/.config/rete` on Linux).
    ///
    /// # Errors
    ///
    /// Fails if the platform has no config directory or it cannot be created.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from("dev", "flyingrobots", "rete")
            .ok_or_else(|| ConfigError::Other("no platform config directory".into()))?;
        Self::at(dirs.config_dir())
    }

    /// Store under `base`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Fails if `base` cannot be created.
    pub fn at(base: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    fn file(&self, key: &str) -> PathBuf {
        self.base.join(format!("{key}.json"))
    }
}

impl ConfigStore for FsConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        fs::read(self.file(key)).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => ConfigError::NotFound,
            _ => ConfigError::Io(err),
        })
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        // The directory may have been removed since construction.
        fs::create_dir_all(&self.base)?;
        fs::write(self.file(key), data)?;
        Ok(())
    }
}
