use std::path::{Path, PathBuf};

use shared::{
    domain::{builtin_positions, is_builtin_name, Position},
    hooks::ConfirmPrompt,
};
use tracing::info;

use crate::{NamedCollection, StoreError};

/// Library of named arm positions. The built-in presets always come first and
/// are synthesized on every load rather than persisted.
#[derive(Debug)]
pub struct PositionStore {
    collection: NamedCollection<Position>,
}

impl PositionStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            collection: NamedCollection::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.collection.path()
    }

    /// Built-in presets followed by every persisted position, in document order.
    pub fn load_all(&mut self) -> Result<Vec<Position>, StoreError> {
        let mut positions = builtin_positions();
        positions.extend_from_slice(self.collection.reload()?);
        Ok(positions)
    }

    /// Only the persisted positions.
    pub fn load_saved(&mut self) -> Result<Vec<Position>, StoreError> {
        Ok(self.collection.reload()?.to_vec())
    }

    pub fn find(&mut self, name: &str) -> Result<Option<Position>, StoreError> {
        if let Some(builtin) = builtin_positions().into_iter().find(|p| p.has_name(name)) {
            return Ok(Some(builtin));
        }
        self.collection.find(name)
    }

    pub fn save(&mut self, position: Position) -> Result<(), StoreError> {
        if is_builtin_name(&position.name) {
            return Err(StoreError::BuiltInName(position.name));
        }
        let name = position.name.clone();
        self.collection.insert(position)?;
        info!(path = %self.path().display(), %name, "position saved");
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> Result<Position, StoreError> {
        if is_builtin_name(name) {
            return Err(StoreError::BuiltInDelete(name.to_string()));
        }
        let removed = self.collection.remove(name)?;
        info!(path = %self.path().display(), name = %removed.name, "position deleted");
        Ok(removed)
    }

    /// Deletes `name` after the operator confirms. Returns `Ok(None)` when the
    /// prompt is declined, in which case the document is left untouched.
    pub fn delete_confirmed(
        &mut self,
        name: &str,
        prompt: &dyn ConfirmPrompt,
    ) -> Result<Option<Position>, StoreError> {
        if is_builtin_name(name) {
            return Err(StoreError::BuiltInDelete(name.to_string()));
        }
        let Some(existing) = self.collection.find(name)? else {
            return Err(StoreError::NotFound(name.to_string()));
        };
        if !prompt.confirm(&format!("Delete position '{}'?", existing.name)) {
            return Ok(None);
        }
        self.delete(name).map(Some)
    }
}
