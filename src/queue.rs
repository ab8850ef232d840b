//! Durable, ordered log of local mutations awaiting upload.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::StorageError;
use crate::models::{ChangeKind, EntityKey, MergedChanges, PendingChange, SyncedEntity, Tombstone};
use crate::state::{load_record, save_record, StateStore, PENDING_CHANGES_KEY};
use crate::store::LocalStore;

const RECORD_VERSION: u32 = 1;

/// Receives every change right after it is enqueued.
pub trait ChangeNotifier: Send + Sync {
    fn notify(&self, change: &PendingChange);
}

pub struct PendingQueue {
    state: Arc<dyn StateStore>,
    entries: Mutex<Option<Vec<PendingChange>>>,
    notifier: Mutex<Option<Arc<dyn ChangeNotifier>>>,
    degraded: AtomicBool,
}

impl PendingQueue {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self {
            state,
            entries: Mutex::new(None),
            notifier: Mutex::new(None),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn set_notifier(&self, notifier: Option<Arc<dyn ChangeNotifier>>) {
        *self.notifier.lock().unwrap_or_else(|e| e.into_inner()) = notifier;
    }

    /// True when the last persist attempt failed and the in-memory log is
    /// ahead of what is on disk.
    pub fn persistence_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Writes the in-memory log back to state. Success clears the degraded
    /// flag.
    pub fn flush(&self) -> Result<(), StorageError> {
        let mut entries = self.entries()?;
        let log = loaded(&mut entries);
        let result = save_record(self.state.as_ref(), PENDING_CHANGES_KEY, RECORD_VERSION, &log);
        self.degraded.store(result.is_err(), Ordering::SeqCst);
        result
    }

    /// Records a local mutation. Repeated changes to one entity are all kept.
    pub fn enqueue(
        &self,
        kind: ChangeKind,
        payload: SyncedEntity,
    ) -> Result<PendingChange, StorageError> {
        let change = PendingChange::new(kind, payload);
        {
            let mut entries = self.entries()?;
            let log = loaded(&mut entries);
            log.push(change.clone());
            self.persist(log);
        }
        debug!(change = %change, "Enqueued change");

        let notifier = self
            .notifier
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(notifier) = notifier {
            notifier.notify(&change);
        }
        Ok(change)
    }

    /// Snapshot of every entry in enqueue order.
    pub fn drain(&self) -> Result<Vec<PendingChange>, StorageError> {
        let mut entries = self.entries()?;
        Ok(loaded(&mut entries).clone())
    }

    pub fn remove(&self, ids: &[Uuid]) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut entries = self.entries()?;
        let log = loaded(&mut entries);
        let before = log.len();
        log.retain(|c| !ids.contains(&c.id));
        if log.len() != before {
            self.persist(log);
        }
        Ok(())
    }

    pub fn size(&self) -> Result<usize, StorageError> {
        let mut entries = self.entries()?;
        Ok(loaded(&mut entries).len())
    }

    pub fn mark_failed(&self, ids: &[Uuid]) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut entries = self.entries()?;
        let log = loaded(&mut entries);
        for change in log.iter_mut().filter(|c| ids.contains(&c.id)) {
            change.record_failure();
            if change.is_exhausted() {
                warn!(change = %change, "Change reached the retry cap");
            }
        }
        self.persist(log);
        Ok(())
    }

    /// Entries that hit the retry cap and need manual inspection.
    pub fn exhausted(&self) -> Result<Vec<PendingChange>, StorageError> {
        Ok(self
            .drain()?
            .into_iter()
            .filter(PendingChange::is_exhausted)
            .collect())
    }

    /// Deletions still in effect: one per entity whose latest queued
    /// change is a delete.
    pub fn tombstones(&self) -> Result<Vec<Tombstone>, StorageError> {
        Ok(latest_per_entity(&self.drain()?)
            .into_values()
            .filter_map(PendingChange::tombstone)
            .collect())
    }

    /// Re-applies every queued change onto `store`, in order. Used after a
    /// restart so the store reflects every change that was accepted.
    pub fn replay(&self, store: &dyn LocalStore) -> Result<usize, StorageError> {
        let changes = self.drain()?;
        for change in &changes {
            let mut merged = MergedChanges::default();
            match change.tombstone() {
                Some(tombstone) => merged.removals.push(tombstone),
                None => merged.upserts.upsert(change.payload.clone()),
            }
            store.write(&merged)?;
        }
        debug!(count = changes.len(), "Replayed pending changes");
        Ok(changes.len())
    }

    fn entries(&self) -> Result<MutexGuard<'_, Option<Vec<PendingChange>>>, StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.is_none() {
            let log: Vec<PendingChange> =
                load_record(self.state.as_ref(), PENDING_CHANGES_KEY, RECORD_VERSION)?
                    .unwrap_or_default();
            debug!(count = log.len(), "Loaded pending changes");
            *entries = Some(log);
        }
        Ok(entries)
    }

    fn persist(&self, log: &[PendingChange]) {
        match save_record(self.state.as_ref(), PENDING_CHANGES_KEY, RECORD_VERSION, &log) {
            Ok(()) => {
                self.degraded.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                error!(error = %e, "Failed to persist pending changes");
                self.degraded.store(true, Ordering::SeqCst);
            }
        }
    }
}

/// The last change of every entity in `changes`, keyed and sorted by entity.
pub(crate) fn latest_per_entity(
    changes: &[PendingChange],
) -> BTreeMap<EntityKey, &PendingChange> {
    let mut latest = BTreeMap::new();
    for change in changes {
        latest.insert(change.key(), change);
    }
    latest
}

fn loaded(entries: &mut Option<Vec<PendingChange>>) -> &mut Vec<PendingChange> {
    entries.get_or_insert_with(Vec::new)
}

impl std::fmt::Debug for PendingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingQueue")
            .field("degraded", &self.persistence_degraded())
            .finish_non_exhaustive()
    }
}
