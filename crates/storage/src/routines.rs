use std::path::{Path, PathBuf};

use shared::{domain::Routine, hooks::ConfirmPrompt};
use tracing::info;

use crate::{NamedCollection, StoreError};

#[derive(Debug)]
pub struct RoutineStore {
    collection: NamedCollection<Routine>,
}

impl RoutineStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            collection: NamedCollection::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.collection.path()
    }

    pub fn load_all(&mut self) -> Result<Vec<Routine>, StoreError> {
        Ok(self.collection.reload()?.to_vec())
    }

    pub fn find(&mut self, name: &str) -> Result<Option<Routine>, StoreError> {
        self.collection.find(name)
    }

    pub fn save(&mut self, routine: Routine) -> Result<(), StoreError> {
        if routine.steps.is_empty() {
            return Err(StoreError::EmptyRoutine(routine.name));
        }
        let (name, steps) = (routine.name.clone(), routine.steps.len());
        self.collection.insert(routine)?;
        info!(path = %self.path().display(), %name, steps, "routine saved");
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> Result<Routine, StoreError> {
        let removed = self.collection.remove(name)?;
        info!(path = %self.path().display(), name = %removed.name, "routine deleted");
        Ok(removed)
    }

    pub fn delete_confirmed(
        &mut self,
        name: &str,
        prompt: &dyn ConfirmPrompt,
    ) -> Result<Option<Routine>, StoreError> {
        let Some(existing) = self.collection.find(name)? else {
            return Err(StoreError::NotFound(name.to_string()));
        };
        if !prompt.confirm(&format!(
            "Permanently delete routine '{}'?",
            existing.name
        )) {
            return Ok(None);
        }
        self.delete(name).map(Some)
    }
}
