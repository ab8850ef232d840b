//! Persisted engine state.
//!
//! Small records (the pending-change log, the sync watermark) are stored
//! as versioned JSON under fixed keys:
//!
//! ```text
//! <STATE_DIR>/
//!   splitsync.pending_changes.json
//!   splitsync.last_sync.json
//! ```
//!
//! Each file holds `{"version": N, "data": ...}`. Writes go to a temp file
//! that is renamed over the target.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::StorageError;

/// Key of the pending-change log.
pub const PENDING_CHANGES_KEY: &str = "splitsync.pending_changes";
/// Key of the last-sync watermark.
pub const LAST_SYNC_KEY: &str = "splitsync.last_sync";

/// Raw key/value persistence used by the queue and the orchestrator.
pub trait StateStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError>;

    fn save(&self, key: &str, value: &serde_json::Value) -> Result<(), StorageError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Record<T> {
    version: u32,
    data: T,
}

/// Loads a versioned record, rejecting any version other than `version`.
pub fn load_record<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
    version: u32,
) -> Result<Option<T>, StorageError> {
    let Some(value) = store.load(key)? else {
        return Ok(None);
    };
    let record: Record<serde_json::Value> =
        serde_json::from_value(value).map_err(|e| StorageError::decode(key, e))?;
    if record.version != version {
        return Err(StorageError::UnsupportedVersion {
            key: key.to_string(),
            found: record.version,
            expected: version,
        });
    }
    let data = serde_json::from_value(record.data).map_err(|e| StorageError::decode(key, e))?;
    Ok(Some(data))
}

pub fn save_record<T: Serialize>(
    store: &dyn StateStore,
    key: &str,
    version: u32,
    data: &T,
) -> Result<(), StorageError> {
    let value =
        serde_json::to_value(Record { version, data }).map_err(|e| StorageError::encode(key, e))?;
    store.save(key, &value)
}

/// One JSON file per key in a state directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Keys become file names, so they may not contain path separators.
    fn validate_key(key: &str) -> Result<(), StorageError> {
        if key.is_empty()
            || key.contains('/')
            || key.contains('\\')
            || key.contains("..")
            || key.starts_with('.')
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    pub fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl StateStore for FileStateStore {
    fn load(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        Self::validate_key(key)?;
        let path = self.path(key);

        match fs::read(&path) {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| StorageError::decode(key, e))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    fn save(&self, key: &str, value: &serde_json::Value) -> Result<(), StorageError> {
        Self::validate_key(key)?;
        fs::create_dir_all(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;

        let bytes = serde_json::to_vec_pretty(value).map_err(|e| StorageError::encode(key, e))?;
        write_atomic(&self.path(key), &bytes)
    }
}

/// Writes `bytes` to a temp file next to `path` and renames it into place.
pub(crate) fn write_atomic(path: &PathBuf, bytes: &[u8]) -> Result<(), StorageError> {
    let temp_path = path.with_extension("json.tmp");

    let mut file = File::create(&temp_path).map_err(|e| StorageError::io(&temp_path, e))?;
    file.write_all(bytes)
        .map_err(|e| StorageError::io(&temp_path, e))?;
    file.sync_all()
        .map_err(|e| StorageError::io(&temp_path, e))?;

    fs::rename(&temp_path, path).map_err(|e| StorageError::io(path, e))?;
    Ok(())
}

/// In-memory state, for tests and for hosts that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    values: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn save(&self, key: &str, value: &serde_json::Value) -> Result<(), StorageError> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.clone());
        Ok(())
    }
}
