//! Server-side record store.
//!
//! Keeps one account per user id: the latest version of every record it
//! has seen plus the legacy whole-payload snapshot. Each record remembers
//! when the server stored it, which is what download watermarks compare
//! against. Accounts persist through a [`StateStore`] under
//! `splitsync.remote.<user_id>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::models::{EntityKey, EntitySet, EntityVersion};
use crate::state::{load_record, save_record, StateStore};
use crate::transport::protocol::SyncData;

const RECORD_VERSION: u32 = 1;

/// Errors that can occur in the remote store.
#[derive(Debug)]
pub enum RemoteStoreError {
    /// User id is empty or not usable as a storage key.
    InvalidUserId(String),
    /// Failure reading or writing an account.
    Storage(StorageError),
}

impl std::fmt::Display for RemoteStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteStoreError::InvalidUserId(id) => write!(f, "Invalid user id: {:?}", id),
            RemoteStoreError::Storage(e) => write!(f, "Storage error: {}", e),
        }
    }
}

impl std::error::Error for RemoteStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RemoteStoreError::Storage(e) => Some(e),
            RemoteStoreError::InvalidUserId(_) => None,
        }
    }
}

impl From<StorageError> for RemoteStoreError {
    fn from(e: StorageError) -> Self {
        RemoteStoreError::Storage(e)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    key: EntityKey,
    version: EntityVersion,
    stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Account {
    records: Vec<StoredRecord>,
    #[serde(default)]
    legacy_payload: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default)]
struct AccountState {
    records: BTreeMap<EntityKey, StoredRecord>,
    legacy_payload: serde_json::Map<String, serde_json::Value>,
}

impl From<Account> for AccountState {
    fn from(account: Account) -> Self {
        Self {
            records: account
                .records
                .into_iter()
                .map(|r| (r.key.clone(), r))
                .collect(),
            legacy_payload: account.legacy_payload,
        }
    }
}

impl AccountState {
    fn to_account(&self) -> Account {
        Account {
            records: self.records.values().cloned().collect(),
            legacy_payload: self.legacy_payload.clone(),
        }
    }
}

/// Result of applying one upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadOutcome {
    /// Records that replaced or created a stored version.
    pub accepted: usize,
    /// Records kept back, one message each.
    pub errors: Vec<String>,
}

/// Per-user record store with last-writer-wins semantics.
pub struct RemoteStore {
    state: Option<Arc<dyn StateStore>>,
    accounts: Mutex<HashMap<String, AccountState>>,
}

impl RemoteStore {
    /// Creates a store that lives only in memory.
    pub fn new() -> Self {
        Self {
            state: None,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a store that loads and saves accounts through `state`.
    pub fn with_state(state: Arc<dyn StateStore>) -> Self {
        Self {
            state: Some(state),
            accounts: Mutex::new(HashMap::new()),
        }
    }

    /// User ids become storage keys, so they may not contain path
    /// separators or start with a dot.
    fn validate_user_id(user_id: &str) -> Result<(), RemoteStoreError> {
        if user_id.is_empty()
            || user_id.contains('/')
            || user_id.contains('\\')
            || user_id.contains("..")
            || user_id.starts_with('.')
        {
            return Err(RemoteStoreError::InvalidUserId(user_id.to_string()));
        }
        Ok(())
    }

    fn state_key(user_id: &str) -> String {
        format!("splitsync.remote.{}", user_id)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AccountState>> {
        self.accounts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `f` against a user's account, loading it on first access and
    /// saving it afterwards when `f` reports a change.
    fn with_account<R>(
        &self,
        user_id: &str,
        f: impl FnOnce(&mut AccountState) -> (R, bool),
    ) -> Result<R, RemoteStoreError> {
        Self::validate_user_id(user_id)?;
        let mut accounts = self.lock();

        if !accounts.contains_key(user_id) {
            let loaded = match &self.state {
                Some(state) => {
                    load_record::<Account>(state.as_ref(), &Self::state_key(user_id), RECORD_VERSION)?
                }
                None => None,
            };
            accounts.insert(user_id.to_string(), loaded.map(AccountState::from).unwrap_or_default());
        }

        let Some(account) = accounts.get_mut(user_id) else {
            return Err(RemoteStoreError::InvalidUserId(user_id.to_string()));
        };
        let (result, changed) = f(account);

        if changed {
            if let Some(state) = &self.state {
                save_record(
                    state.as_ref(),
                    &Self::state_key(user_id),
                    RECORD_VERSION,
                    &account.to_account(),
                )?;
            }
        }
        Ok(result)
    }

    /// Applies an upload.
    ///
    /// Live records replace the stored version only when strictly newer,
    /// so a repeated upload changes nothing. A deletion removes the stored
    /// record unless that record is newer than the deletion or was modified
    /// after the uploader's `last_sync`. Either way the uploader deleted a
    /// version it never saw, so the record is kept and an error is reported.
    pub fn apply_upload(
        &self,
        user_id: &str,
        data: &SyncData,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<UploadOutcome, RemoteStoreError> {
        let now = Utc::now();
        self.with_account(user_id, |account| {
            let mut outcome = UploadOutcome::default();

            for entity in data.entities.entities() {
                let key = entity.key();
                let incoming = EntityVersion::Live(entity);
                let newer = account
                    .records
                    .get(&key)
                    .map_or(true, |stored| incoming.timestamp() > stored.version.timestamp());
                if newer {
                    account.records.insert(
                        key.clone(),
                        StoredRecord {
                            key,
                            version: incoming,
                            stored_at: now,
                        },
                    );
                    outcome.accepted += 1;
                }
            }

            for tombstone in &data.deleted {
                let key = tombstone.key();
                match account.records.get(&key) {
                    Some(stored) if !stored.version.is_deleted() => {
                        let modified = stored.version.timestamp();
                        let unseen = last_sync.is_some_and(|since| modified > since);
                        if modified > tombstone.deleted_at || unseen {
                            warn!(user_id, key = %key, "Refusing deletion of a remotely modified record");
                            outcome
                                .errors
                                .push(format!("{} was modified remotely; deletion not applied", key));
                            continue;
                        }
                    }
                    Some(stored) if stored.version.timestamp() >= tombstone.deleted_at => continue,
                    _ => {}
                }
                account.records.insert(
                    key.clone(),
                    StoredRecord {
                        key,
                        version: EntityVersion::Deleted(tombstone.clone()),
                        stored_at: now,
                    },
                );
                outcome.accepted += 1;
            }

            debug!(
                user_id,
                accepted = outcome.accepted,
                refused = outcome.errors.len(),
                "Applied upload"
            );
            let changed = outcome.accepted > 0;
            (outcome, changed)
        })
    }

    /// Records stored after `since`, or everything when `since` is `None`.
    pub fn download(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<SyncData, RemoteStoreError> {
        self.with_account(user_id, |account| {
            let mut data = SyncData::default();
            let changed = account
                .records
                .values()
                .filter(|r| since.map_or(true, |since| r.stored_at > since));
            for record in changed {
                match &record.version {
                    EntityVersion::Live(entity) => data.entities.upsert(entity.clone()),
                    EntityVersion::Deleted(tombstone) => data.deleted.push(tombstone.clone()),
                }
            }
            data.entities.sort_by_id();
            (data, false)
        })
    }

    /// Live records only, sorted by id.
    pub fn snapshot(&self, user_id: &str) -> Result<EntitySet, RemoteStoreError> {
        self.with_account(user_id, |account| {
            let mut entities: EntitySet = account
                .records
                .values()
                .filter_map(|r| r.version.live().cloned())
                .collect();
            entities.sort_by_id();
            (entities, false)
        })
    }

    /// Replaces the legacy snapshot wholesale.
    pub fn push_payload(
        &self,
        user_id: &str,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), RemoteStoreError> {
        self.with_account(user_id, |account| {
            account.legacy_payload = payload;
            ((), true)
        })
    }

    /// The legacy snapshot; empty for users that never pushed.
    pub fn pull_payload(
        &self,
        user_id: &str,
    ) -> Result<serde_json::Map<String, serde_json::Value>, RemoteStoreError> {
        self.with_account(user_id, |account| (account.legacy_payload.clone(), false))
    }
}

impl Default for RemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("accounts", &self.lock().len())
            .field("persistent", &self.state.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, Expense, Group, SyncedEntity, Tombstone};
    use crate::state::{FileStateStore, MemoryStateStore};
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn expense(id: &str, amount: f64, updated: i64) -> SyncedEntity {
        let mut e = Expense::new("g1", "Dinner", amount, "m1").with_id(id);
        e.created_at = at(0);
        e.updated_at = Some(at(updated));
        e.into()
    }

    fn upload_of(entities: Vec<SyncedEntity>, deleted: Vec<Tombstone>) -> SyncData {
        SyncData {
            entities: entities.into_iter().collect(),
            deleted,
        }
    }

    fn expense_key(id: &str) -> EntityKey {
        EntityKey::new(EntityType::Expense, id)
    }

    #[test]
    fn test_repeated_upload_is_idempotent() {
        let store = RemoteStore::new();
        let data = upload_of(vec![expense("e1", 100.0, 1), Group::new("Trip").with_id("g1").into()], vec![]);

        let first = store.apply_upload("u1", &data, None).unwrap();
        let once = store.snapshot("u1").unwrap();
        let second = store.apply_upload("u1", &data, None).unwrap();

        assert_eq!(first.accepted, 2);
        assert_eq!(second.accepted, 0);
        assert_eq!(store.snapshot("u1").unwrap(), once);
    }

    #[test]
    fn test_last_writer_wins_and_ties_keep_stored() {
        let store = RemoteStore::new();
        store
            .apply_upload("u1", &upload_of(vec![expense("e1", 100.0, 6)], vec![]), None)
            .unwrap();

        let older = store
            .apply_upload("u1", &upload_of(vec![expense("e1", 200.0, 5)], vec![]), None)
            .unwrap();
        let tie = store
            .apply_upload("u1", &upload_of(vec![expense("e1", 300.0, 6)], vec![]), None)
            .unwrap();

        assert_eq!(older.accepted, 0);
        assert_eq!(tie.accepted, 0);
        assert_eq!(store.snapshot("u1").unwrap().expenses[0].amount, 100.0);
    }

    #[test]
    fn test_deletion_removes_older_record() {
        let store = RemoteStore::new();
        store
            .apply_upload("u1", &upload_of(vec![expense("e1", 100.0, 1)], vec![]), None)
            .unwrap();
        let outcome = store
            .apply_upload(
                "u1",
                &upload_of(vec![], vec![Tombstone::new(EntityType::Expense, "e1", at(2))]),
                None,
            )
            .unwrap();

        assert_eq!(outcome.accepted, 1);
        assert!(outcome.errors.is_empty());
        assert!(store.snapshot("u1").unwrap().is_empty());
        assert_eq!(store.download("u1", None).unwrap().deleted.len(), 1);
    }

    #[test]
    fn test_deletion_older_than_record_is_refused() {
        let store = RemoteStore::new();
        store
            .apply_upload("u1", &upload_of(vec![expense("e1", 100.0, 9)], vec![]), None)
            .unwrap();

        let outcome = store
            .apply_upload(
                "u1",
                &upload_of(vec![], vec![Tombstone::new(EntityType::Expense, "e1", at(4))]),
                None,
            )
            .unwrap();

        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(store.snapshot("u1").unwrap().len(), 1);
    }

    #[test]
    fn test_deletion_of_unseen_update_is_refused() {
        let store = RemoteStore::new();
        store
            .apply_upload("u1", &upload_of(vec![expense("e1", 100.0, 5)], vec![]), None)
            .unwrap();

        let deleted = vec![Tombstone::new(EntityType::Expense, "e1", at(6))];
        let stale = store
            .apply_upload("u1", &upload_of(vec![], deleted.clone()), Some(at(4)))
            .unwrap();
        assert_eq!(stale.errors.len(), 1);
        assert_eq!(store.snapshot("u1").unwrap().len(), 1);

        let current = store
            .apply_upload("u1", &upload_of(vec![], deleted), Some(at(5)))
            .unwrap();
        assert!(current.errors.is_empty());
        assert!(store.snapshot("u1").unwrap().is_empty());
    }

    #[test]
    fn test_newer_record_recreates_deleted_one() {
        let store = RemoteStore::new();
        store
            .apply_upload(
                "u1",
                &upload_of(vec![], vec![Tombstone::new(EntityType::Expense, "e1", at(3))]),
                None,
            )
            .unwrap();
        store
            .apply_upload("u1", &upload_of(vec![expense("e1", 50.0, 2)], vec![]), None)
            .unwrap();
        assert!(store.snapshot("u1").unwrap().is_empty());

        store
            .apply_upload("u1", &upload_of(vec![expense("e1", 50.0, 4)], vec![]), None)
            .unwrap();
        assert_eq!(store.snapshot("u1").unwrap().len(), 1);
    }

    #[test]
    fn test_download_filters_by_stored_at() {
        let store = RemoteStore::new();
        store
            .apply_upload("u1", &upload_of(vec![expense("e1", 100.0, 1)], vec![]), None)
            .unwrap();
        let after_first = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store
            .apply_upload("u1", &upload_of(vec![expense("e2", 100.0, 1)], vec![]), None)
            .unwrap();

        assert_eq!(store.download("u1", None).unwrap().entities.len(), 2);
        let since = store.download("u1", Some(after_first)).unwrap();
        assert_eq!(since.entities.expenses.len(), 1);
        assert_eq!(since.entities.expenses[0].id, "e2");
    }

    #[test]
    fn test_accounts_are_isolated() {
        let store = RemoteStore::new();
        store
            .apply_upload("u1", &upload_of(vec![expense("e1", 100.0, 1)], vec![]), None)
            .unwrap();
        assert!(store.download("u2", None).unwrap().entities.is_empty());
    }

    #[test]
    fn test_invalid_user_id_rejected() {
        let store = RemoteStore::new();
        assert!(matches!(
            store.download("../etc", None),
            Err(RemoteStoreError::InvalidUserId(_))
        ));
        assert!(matches!(
            store.pull_payload(""),
            Err(RemoteStoreError::InvalidUserId(_))
        ));
    }

    #[test]
    fn test_legacy_payload_round_trip() {
        let store = RemoteStore::new();
        assert!(store.pull_payload("u1").unwrap().is_empty());

        let payload = json!({"groups": [{"id": "g1"}]});
        let payload = payload.as_object().unwrap().clone();
        store.push_payload("u1", payload.clone()).unwrap();
        assert_eq!(store.pull_payload("u1").unwrap(), payload);
    }

    #[test]
    fn test_accounts_persist_across_instances() {
        let temp = TempDir::new().unwrap();
        let state: Arc<dyn StateStore> = Arc::new(FileStateStore::new(temp.path()));

        let store = RemoteStore::with_state(state.clone());
        store
            .apply_upload("u1", &upload_of(vec![expense("e1", 100.0, 1)], vec![]), None)
            .unwrap();
        assert!(temp.path().join("splitsync.remote.u1.json").exists());

        let reopened = RemoteStore::with_state(state);
        assert_eq!(reopened.snapshot("u1").unwrap().expenses[0].id, "e1");
    }

    #[test]
    fn test_reads_do_not_write() {
        let state = Arc::new(MemoryStateStore::new());
        let store = RemoteStore::with_state(state.clone());
        store.download("u1", None).unwrap();
        assert!(state.load("splitsync.remote.u1").unwrap().is_none());
    }
}
