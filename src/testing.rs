//! In-process test doubles: a transport over a [`RemoteStore`] and a state
//! store, both with failure injection.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::server::{RemoteStore, RemoteStoreError};
use crate::state::{MemoryStateStore, StateStore};
use crate::transport::protocol::SyncData;
use crate::transport::{Ack, Delta, RemoteDelta, Transport, TransportError};

/// Talks to a shared [`RemoteStore`] directly. Several devices can share
/// one store by cloning it into several loopbacks.
pub struct LoopbackTransport {
    remote: Arc<RemoteStore>,
    user_id: String,
    failing_uploads: AtomicUsize,
    failing_downloads: AtomicUsize,
    uploads: Mutex<Vec<Delta>>,
    downloads: AtomicUsize,
}

impl LoopbackTransport {
    pub fn new(remote: Arc<RemoteStore>, user_id: &str) -> Self {
        Self {
            remote,
            user_id: user_id.to_string(),
            failing_uploads: AtomicUsize::new(0),
            failing_downloads: AtomicUsize::new(0),
            uploads: Mutex::new(Vec::new()),
            downloads: AtomicUsize::new(0),
        }
    }

    /// The next `count` uploads fail with a network error.
    pub fn fail_uploads(&self, count: usize) {
        self.failing_uploads.store(count, Ordering::SeqCst);
    }

    /// The next `count` downloads fail with a network error.
    pub fn fail_downloads(&self, count: usize) {
        self.failing_downloads.store(count, Ordering::SeqCst);
    }

    /// Every delta that reached the remote, in order.
    pub fn uploads(&self) -> Vec<Delta> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn injected(counter: &AtomicUsize) -> Result<(), TransportError> {
        let failed = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(TransportError::Network("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

fn store_error(e: RemoteStoreError) -> TransportError {
    TransportError::Status {
        status: 500,
        body: e.to_string(),
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn upload(
        &self,
        delta: &Delta,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<Ack, TransportError> {
        Self::injected(&self.failing_uploads)?;
        let outcome = self
            .remote
            .apply_upload(&self.user_id, &SyncData::from(delta), last_sync)
            .map_err(store_error)?;
        self.uploads.lock().unwrap().push(delta.clone());
        Ok(Ack {
            errors: outcome.errors,
        })
    }

    async fn download(&self, since: Option<DateTime<Utc>>) -> Result<RemoteDelta, TransportError> {
        Self::injected(&self.failing_downloads)?;
        let data = self
            .remote
            .download(&self.user_id, since)
            .map_err(store_error)?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(RemoteDelta {
            delta: data.into(),
            errors: Vec::new(),
        })
    }
}

/// Memory-backed state whose writes can be switched off.
#[derive(Default)]
pub struct FlakyStateStore {
    inner: MemoryStateStore,
    failing: AtomicBool,
}

impl FlakyStateStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl StateStore for FlakyStateStore {
    fn load(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        self.inner.load(key)
    }

    fn save(&self, key: &str, value: &serde_json::Value) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        self.inner.save(key, value)
    }
}
