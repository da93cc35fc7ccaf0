use std::{
    fs, io,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Serialize};
use shared::{
    config::ConfigError,
    domain::{normalize_name, Position, Routine},
    error::{ErrorCode, ReportedError},
};
use thiserror::Error;

mod config_store;
mod positions;
mod routines;

pub use config_store::ConfigStore;
pub use positions::PositionStore;
pub use routines::RoutineStore;

pub const POSITIONS_FILE: &str = "posiciones.json";
pub const ROUTINES_FILE: &str = "rutinas.json";
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read '{}': {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write '{}': {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("document '{}' is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("'{0}' not found")]
    NotFound(String),
    #[error("an entry named '{0}' already exists")]
    DuplicateName(String),
    #[error("'{0}' is the name of a built-in position")]
    BuiltInName(String),
    #[error("built-in position '{0}' cannot be deleted")]
    BuiltInDelete(String),
    #[error("name must not be empty")]
    EmptyName,
    #[error("routine '{0}' has no steps")]
    EmptyRoutine(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::Read { .. } | StoreError::Write { .. } => ErrorCode::Internal,
            StoreError::Corrupt { .. } => ErrorCode::CorruptStore,
            StoreError::NotFound(_) => ErrorCode::NotFound,
            StoreError::DuplicateName(_) | StoreError::BuiltInName(_) => ErrorCode::DuplicateName,
            StoreError::BuiltInDelete(_)
            | StoreError::EmptyName
            | StoreError::EmptyRoutine(_)
            | StoreError::InvalidConfig(_) => ErrorCode::Validation,
        }
    }

    pub fn report(&self, label: impl Into<String>) -> ReportedError {
        ReportedError::new(self.code(), label, self.to_string())
    }
}

/// A single JSON file holding a whole document of type `D`. Every write
/// replaces the entire file with a pretty-printed rendering.
#[derive(Debug, Clone)]
pub struct JsonDocument<D> {
    path: PathBuf,
    _marker: PhantomData<fn() -> D>,
}

impl<D: Serialize + DeserializeOwned> JsonDocument<D> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `None` when the file does not exist or is blank.
    pub fn read(&self) -> Result<Option<D>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if raw.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    pub fn write(&self, document: &D) -> Result<(), StoreError> {
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let json = serde_json::to_string_pretty(document)
            .map_err(|err| write_err(io::Error::new(io::ErrorKind::InvalidData, err)))?;

        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, json).map_err(write_err)?;
        fs::rename(&staging, &self.path).map_err(write_err)?;
        Ok(())
    }
}

pub trait Named {
    fn name(&self) -> &str;

    fn matches_name(&self, name: &str) -> bool {
        normalize_name(self.name()) == normalize_name(name)
    }
}

impl Named for Position {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for Routine {
    fn name(&self) -> &str {
        &self.name
    }
}

/// An ordered list of uniquely named items backed by one JSON array document.
/// The in-memory copy is refreshed from disk before every mutation.
#[derive(Debug)]
struct NamedCollection<T> {
    document: JsonDocument<Vec<T>>,
    items: Vec<T>,
}

impl<T> NamedCollection<T>
where
    T: Named + Clone + Serialize + DeserializeOwned,
{
    fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            document: JsonDocument::new(path),
            items: Vec::new(),
        }
    }

    fn path(&self) -> &Path {
        self.document.path()
    }

    fn reload(&mut self) -> Result<&[T], StoreError> {
        self.items = self.document.read()?.unwrap_or_default();
        Ok(&self.items)
    }

    fn find(&mut self, name: &str) -> Result<Option<T>, StoreError> {
        Ok(self
            .reload()?
            .iter()
            .find(|item| item.matches_name(name))
            .cloned())
    }

    fn insert(&mut self, item: T) -> Result<(), StoreError> {
        if item.name().trim().is_empty() {
            return Err(StoreError::EmptyName);
        }

        self.reload()?;
        if self.items.iter().any(|existing| existing.matches_name(item.name())) {
            return Err(StoreError::DuplicateName(item.name().to_string()));
        }

        let mut updated = self.items.clone();
        updated.push(item);
        self.document.write(&updated)?;
        self.items = updated;
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<T, StoreError> {
        self.reload()?;
        let index = self
            .items
            .iter()
            .position(|item| item.matches_name(name))
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        let mut updated = self.items.clone();
        let removed = updated.remove(index);
        self.document.write(&updated)?;
        self.items = updated;
        Ok(removed)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
