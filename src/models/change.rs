use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::entity::{EntityKey, EntityType, SyncedEntity, Tombstone};

/// Failed attempts after which a change is kept only for manual inspection.
pub const MAX_RETRY_COUNT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Create => write!(f, "create"),
            ChangeKind::Update => write!(f, "update"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

/// A local mutation that the remote has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub id: Uuid,
    pub kind: ChangeKind,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub payload: SyncedEntity,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl PendingChange {
    pub fn new(kind: ChangeKind, payload: SyncedEntity) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            entity_type: payload.entity_type(),
            entity_id: payload.id().to_string(),
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    /// The deletion this change represents, if it is a delete.
    pub fn tombstone(&self) -> Option<Tombstone> {
        match self.kind {
            ChangeKind::Delete => Some(Tombstone::new(
                self.entity_type,
                self.entity_id.clone(),
                self.enqueued_at,
            )),
            ChangeKind::Create | ChangeKind::Update => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= MAX_RETRY_COUNT
    }

    pub(crate) fn record_failure(&mut self) {
        self.retry_count = (self.retry_count + 1).min(MAX_RETRY_COUNT);
    }
}

impl fmt::Display for PendingChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} (queued {}, retries {})",
            self.kind,
            self.entity_type,
            self.entity_id,
            self.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
            self.retry_count
        )
    }
}
