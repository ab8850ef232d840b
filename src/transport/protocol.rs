//! Wire types shared by the REST client, the real-time channel and the
//! reference server. JSON field names are camelCase unless noted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ChangeKind, EntitySet, EntityType, PendingChange, Tombstone};

use super::Delta;

/// Collections plus deletions, as carried by uploads and downloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncData {
    #[serde(flatten)]
    pub entities: EntitySet,
    /// Omitted when empty so peers without deletion support interoperate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<Tombstone>,
}

impl From<&Delta> for SyncData {
    fn from(delta: &Delta) -> Self {
        Self {
            entities: delta.entities.clone(),
            deleted: delta.deleted.clone(),
        }
    }
}

impl From<SyncData> for Delta {
    fn from(data: SyncData) -> Self {
        Delta::new(data.entities, data.deleted)
    }
}

/// `POST /sync/upload` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub user_id: String,
    pub data: SyncData,
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    /// Lets the server skip announcing the upload back to this device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// `GET /sync/download` query string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadQuery {
    pub user_id: String,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadResponse {
    #[serde(flatten)]
    pub data: SyncData,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Messages on the real-time channel, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeMessage {
    /// First client message when an API key is configured
    Auth {
        #[serde(rename = "apiKey")]
        api_key: String,
    },
    /// Server to client: remote data changed
    SyncUpdate {
        #[serde(rename = "entityType", default, skip_serializing_if = "Option::is_none")]
        entity_type: Option<EntityType>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<String>,
        #[serde(default)]
        entity: serde_json::Value,
    },
    /// Client to server: a local change was recorded
    SyncNotify {
        #[serde(rename = "entityType")]
        entity_type: EntityType,
        action: ChangeKind,
        entity: serde_json::Value,
        #[serde(rename = "userId")]
        user_id: String,
    },
    #[serde(other)]
    Unknown,
}

impl RealtimeMessage {
    pub fn notify(change: &PendingChange, user_id: &str) -> Self {
        RealtimeMessage::SyncNotify {
            entity_type: change.entity_type,
            action: change.kind,
            entity: change.payload.body(),
            user_id: user_id.to_string(),
        }
    }

    /// The update a relay forwards for a notify.
    pub fn update_for(entity_type: EntityType, action: ChangeKind, entity: serde_json::Value) -> Self {
        RealtimeMessage::SyncUpdate {
            entity_type: Some(entity_type),
            action: Some(action.to_string()),
            entity,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// `POST /sync/push` body: a whole-account snapshot (legacy clients).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub user_id: String,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    pub ok: bool,
    pub message: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullQuery {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    pub ok: bool,
    pub user_id: String,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Expense;
    use serde_json::json;

    #[test]
    fn test_upload_request_uses_camel_case() {
        let mut entities = EntitySet::new();
        entities.upsert(Expense::new("g1", "Chai", 40.0, "m1").with_id("e1").into());
        let request = UploadRequest {
            user_id: "u1".to_string(),
            data: SyncData {
                entities,
                deleted: Vec::new(),
            },
            last_sync_timestamp: None,
            device_id: None,
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["userId"], "u1");
        assert!(value["lastSyncTimestamp"].is_null());
        assert_eq!(value["data"]["expenses"][0]["groupId"], "g1");
        assert_eq!(value["data"]["groups"], json!([]));
        assert!(value["data"].get("deleted").is_none());
    }

    #[test]
    fn test_download_response_tolerates_missing_fields() {
        let response: DownloadResponse =
            serde_json::from_value(json!({"groups": [], "errors": ["slow"]})).unwrap();
        assert!(response.data.entities.is_empty());
        assert!(response.data.deleted.is_empty());
        assert_eq!(response.errors, vec!["slow"]);
    }

    #[test]
    fn test_auth_message_shape() {
        let msg = RealtimeMessage::Auth {
            api_key: "k1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "auth", "apiKey": "k1"})
        );
    }

    #[test]
    fn test_sync_update_decodes_entity() {
        let body = serde_json::to_value(Expense::new("g1", "Auto", 60.0, "m2").with_id("e5")).unwrap();
        let text = json!({
            "type": "sync_update",
            "entityType": "expense",
            "action": "update",
            "entity": body,
        })
        .to_string();

        let msg = RealtimeMessage::decode(&text).unwrap();
        let RealtimeMessage::SyncUpdate { entity_type, entity, .. } = msg else {
            panic!("expected sync_update");
        };
        assert_eq!(entity_type, Some(EntityType::Expense));
        assert_eq!(entity["id"], "e5");
    }

    #[test]
    fn test_bare_sync_update_and_unknown_types_decode() {
        let msg = RealtimeMessage::decode(r#"{"type":"sync_update"}"#).unwrap();
        assert!(matches!(msg, RealtimeMessage::SyncUpdate { entity_type: None, .. }));

        let msg = RealtimeMessage::decode(r#"{"type":"presence"}"#).unwrap();
        assert_eq!(msg, RealtimeMessage::Unknown);
    }

    #[test]
    fn test_notify_carries_change() {
        let expense = Expense::new("g1", "Movie", 500.0, "m1").with_id("e9");
        let change = PendingChange::new(ChangeKind::Update, expense.into());
        let value = serde_json::to_value(RealtimeMessage::notify(&change, "u7")).unwrap();
        assert_eq!(value["type"], "sync_notify");
        assert_eq!(value["entityType"], "expense");
        assert_eq!(value["action"], "update");
        assert_eq!(value["entity"]["id"], "e9");
        assert_eq!(value["userId"], "u7");
    }

    #[test]
    fn test_legacy_push_uses_snake_case() {
        let req: PushRequest = serde_json::from_value(json!({
            "user_id": "u1",
            "payload": {"groups": []}
        }))
        .unwrap();
        assert_eq!(req.user_id, "u1");
        assert!(req.payload.contains_key("groups"));
    }
}
