//! The device-local copy of groups, expenses and settlements.

use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::StorageError;
use crate::models::{EntityKey, EntitySet, MergedChanges, SyncedEntity};
use crate::state::write_atomic;

/// Always-writable local persistence for synced entities.
///
/// `write` must never replace a record with an older version, so an edit
/// made while a cycle is in flight survives that cycle's merge.
pub trait LocalStore: Send + Sync {
    fn read(&self) -> Result<EntitySet, StorageError>;

    fn write(&self, changes: &MergedChanges) -> Result<(), StorageError>;

    /// Local mutation: inserts or replaces `entity` unconditionally.
    fn put(&self, entity: SyncedEntity) -> Result<(), StorageError>;

    fn delete(&self, key: &EntityKey) -> Result<Option<SyncedEntity>, StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entities: Mutex<EntitySet>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(entities: EntitySet) -> Self {
        Self {
            entities: Mutex::new(entities),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EntitySet> {
        self.entities.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LocalStore for MemoryStore {
    fn read(&self) -> Result<EntitySet, StorageError> {
        Ok(self.lock().clone())
    }

    fn write(&self, changes: &MergedChanges) -> Result<(), StorageError> {
        self.lock().apply(changes);
        Ok(())
    }

    fn put(&self, entity: SyncedEntity) -> Result<(), StorageError> {
        self.lock().upsert(entity);
        Ok(())
    }

    fn delete(&self, key: &EntityKey) -> Result<Option<SyncedEntity>, StorageError> {
        Ok(self.lock().remove(key))
    }
}

/// One JSON document holding the whole entity set.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    cache: Mutex<Option<EntitySet>>,
}

impl FileStore {
    pub const FILE_NAME: &'static str = "store.json";

    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: data_dir.into().join(Self::FILE_NAME),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn load(&self) -> Result<EntitySet, StorageError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::decode(self.path.display().to_string(), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EntitySet::new()),
            Err(e) => Err(StorageError::io(&self.path, e)),
        }
    }

    fn persist(&self, entities: &EntitySet) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        let bytes = serde_json::to_vec_pretty(entities)
            .map_err(|e| StorageError::encode(self.path.display().to_string(), e))?;
        write_atomic(&self.path, &bytes)
    }

    /// Runs `f` against the cached set and persists the result. The cache
    /// is only updated once the write succeeded.
    fn update<R>(&self, f: impl FnOnce(&mut EntitySet) -> R) -> Result<R, StorageError> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let mut entities = match cache.as_ref() {
            Some(entities) => entities.clone(),
            None => self.load()?,
        };
        let result = f(&mut entities);
        self.persist(&entities)?;
        *cache = Some(entities);
        Ok(result)
    }
}

impl LocalStore for FileStore {
    fn read(&self) -> Result<EntitySet, StorageError> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entities) = cache.as_ref() {
            return Ok(entities.clone());
        }
        let entities = self.load()?;
        *cache = Some(entities.clone());
        Ok(entities)
    }

    fn write(&self, changes: &MergedChanges) -> Result<(), StorageError> {
        if changes.is_empty() {
            return Ok(());
        }
        let touched = self.update(|entities| entities.apply(changes))?;
        tracing::debug!(touched, path = %self.path.display(), "Merged changes into local store");
        Ok(())
    }

    fn put(&self, entity: SyncedEntity) -> Result<(), StorageError> {
        self.update(|entities| entities.upsert(entity))
    }

    fn delete(&self, key: &EntityKey) -> Result<Option<SyncedEntity>, StorageError> {
        self.update(|entities| entities.remove(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, Expense, Group, Timestamped, Tombstone};
    use chrono::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_starts_empty() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path());
        assert!(store.read().unwrap().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let temp = TempDir::new().unwrap();
        let group = Group::new("Goa trip").with_id("g1");
        {
            let store = FileStore::new(temp.path());
            store.put(group.clone().into()).unwrap();
            store
                .put(Expense::new("g1", "Dinner", 1200.0, "m1").with_id("e1").into())
                .unwrap();
        }

        let reopened = FileStore::new(temp.path());
        let entities = reopened.read().unwrap();
        assert_eq!(entities.groups, vec![group]);
        assert_eq!(entities.expenses.len(), 1);
    }

    #[test]
    fn test_write_keeps_newer_local_edit() {
        let store = MemoryStore::new();
        let mut local = Expense::new("g1", "Taxi", 300.0, "m1").with_id("e1");
        let edited_at = local.created_at + Duration::seconds(10);
        local.set_updated_at(edited_at);
        store.put(local.clone().into()).unwrap();

        let mut stale = local.clone();
        stale.amount = 250.0;
        stale.updated_at = Some(edited_at - Duration::seconds(5));
        let mut changes = MergedChanges::default();
        changes.upserts.upsert(stale.into());
        store.write(&changes).unwrap();

        assert_eq!(store.read().unwrap().expenses[0].amount, 300.0);
    }

    #[test]
    fn test_write_applies_removals() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path());
        let expense = Expense::new("g1", "Taxi", 300.0, "m1").with_id("e1");
        let deleted_at = expense.created_at + Duration::seconds(1);
        store.put(expense.into()).unwrap();

        let changes = MergedChanges {
            upserts: EntitySet::new(),
            removals: vec![Tombstone::new(EntityType::Expense, "e1", deleted_at)],
        };
        store.write(&changes).unwrap();

        assert!(store.read().unwrap().is_empty());
        assert!(FileStore::new(temp.path()).read().unwrap().is_empty());
    }

    #[test]
    fn test_delete_returns_removed_entity() {
        let store = MemoryStore::new();
        store.put(Group::new("Flat").with_id("g1").into()).unwrap();
        let removed = store
            .delete(&EntityKey::new(EntityType::Group, "g1"))
            .unwrap();
        assert_eq!(removed.map(|e| e.id().to_string()), Some("g1".to_string()));
        assert!(store
            .delete(&EntityKey::new(EntityType::Group, "g1"))
            .unwrap()
            .is_none());
    }
}
