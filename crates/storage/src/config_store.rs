use std::path::{Path, PathBuf};

use shared::config::ServoConfig;
use tracing::{info, warn};

use crate::{JsonDocument, StoreError};

pub struct ConfigStore {
    document: JsonDocument<ServoConfig>,
}

impl ConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            document: JsonDocument::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.document.path()
    }

    /// Missing document means defaults; a corrupt one is an error.
    pub fn load(&self) -> Result<ServoConfig, StoreError> {
        Ok(self.document.read()?.unwrap_or_default())
    }

    /// Like [`ConfigStore::load`] but degrades to defaults on any failure.
    pub fn load_or_default(&self) -> ServoConfig {
        match self.load() {
            Ok(config) => config,
            Err(error) => {
                warn!(path = %self.path().display(), %error, "using default servo configuration");
                ServoConfig::default()
            }
        }
    }

    pub fn save(&self, config: &ServoConfig) -> Result<(), StoreError> {
        config.validate()?;
        self.document.write(config)?;
        info!(path = %self.path().display(), "servo configuration saved");
        Ok(())
    }
}
