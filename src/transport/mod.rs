//! Moving deltas between a device and the remote store.
//!
//! [`Transport`] is the request/response side (upload, download);
//! [`realtime`] is the push channel that tells a device to sync now.

pub mod protocol;
pub mod realtime;
pub mod rest;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{EntityKey, EntitySet, EntityVersion, Tombstone};

pub use realtime::{RealtimeConfig, RealtimeHandle, RealtimeState};
pub use rest::RestTransport;

/// Failures talking to the remote store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Upload rejected: {}", .0.join("; "))]
    Rejected(Vec<String>),
}

impl TransportError {
    /// Whether retrying the same request later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::Timeout => true,
            TransportError::Status { status, .. } => *status >= 500 || *status == 429,
            TransportError::Decode(_) | TransportError::Rejected(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_decode() {
            TransportError::Decode(e.to_string())
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

/// Entities and deletions one side has changed since a watermark.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub entities: EntitySet,
    pub deleted: Vec<Tombstone>,
}

impl Delta {
    pub fn new(entities: EntitySet, deleted: Vec<Tombstone>) -> Self {
        Self { entities, deleted }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entities.len() + self.deleted.len()
    }

    /// Every key this delta touches with the version it carries. If a key
    /// appears both live and deleted, the later timestamp wins and a tie
    /// keeps the live record.
    pub fn versions(&self) -> BTreeMap<EntityKey, EntityVersion> {
        let mut versions: BTreeMap<EntityKey, EntityVersion> = self
            .deleted
            .iter()
            .map(|t| (t.key(), EntityVersion::Deleted(t.clone())))
            .collect();
        for entity in self.entities.entities() {
            let key = entity.key();
            let live = EntityVersion::Live(entity);
            match versions.get(&key) {
                Some(existing) if existing.timestamp() > live.timestamp() => {}
                _ => {
                    versions.insert(key, live);
                }
            }
        }
        versions
    }
}

/// Server acknowledgement of an accepted upload. `errors` lists per-record
/// problems the server reported without rejecting the upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ack {
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteDelta {
    pub delta: Delta,
    pub errors: Vec<String>,
}

/// Request/response access to the remote store.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends local changes. Must be safe to repeat with the same delta.
    async fn upload(
        &self,
        delta: &Delta,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<Ack, TransportError>;

    /// Fetches remote changes made after `since` (everything when `None`).
    async fn download(&self, since: Option<DateTime<Utc>>) -> Result<RemoteDelta, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, Expense, SyncedEntity, Timestamped};
    use chrono::Duration;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::Network("reset".into()).is_transient());
        assert!(TransportError::Status {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(!TransportError::Status {
            status: 401,
            body: String::new()
        }
        .is_transient());
        assert!(!TransportError::Rejected(vec!["bad".into()]).is_transient());
    }

    #[test]
    fn test_rejected_display_joins_errors() {
        let err = TransportError::Rejected(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Upload rejected: a; b");
    }

    #[test]
    fn test_versions_prefers_later_of_live_and_deleted() {
        let expense = Expense::new("g1", "Snacks", 90.0, "m1").with_id("e1");
        let created = expense.created_at;
        let mut entities = EntitySet::new();
        entities.upsert(SyncedEntity::from(expense));

        let newer_delete = Delta::new(
            entities.clone(),
            vec![Tombstone::new(EntityType::Expense, "e1", created + Duration::seconds(1))],
        );
        assert!(newer_delete.versions()[&EntityKey::new(EntityType::Expense, "e1")].is_deleted());

        let tie = Delta::new(
            entities,
            vec![Tombstone::new(EntityType::Expense, "e1", created)],
        );
        let version = &tie.versions()[&EntityKey::new(EntityType::Expense, "e1")];
        assert_eq!(version.live().map(|e| e.effective_timestamp()), Some(created));
    }
}
