use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::entity::Timestamped;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    #[default]
    Pending,
    Completed,
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementStatus::Pending => write!(f, "pending"),
            SettlementStatus::Completed => write!(f, "completed"),
        }
    }
}

/// A payment from one member to another that settles a balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    pub id: String,
    pub group_id: String,
    pub from_id: String,
    pub to_id: String,
    pub amount: f64,
    #[serde(default)]
    pub status: SettlementStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Settlement {
    pub fn new(
        group_id: impl Into<String>,
        from_id: impl Into<String>,
        to_id: impl Into<String>,
        amount: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            group_id: group_id.into(),
            from_id: from_id.into(),
            to_id: to_id.into(),
            amount,
            status: SettlementStatus::Pending,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == SettlementStatus::Completed
    }
}

impl Timestamped for Settlement {
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = Some(at);
    }
}

impl fmt::Display for Settlement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}: {:.2} ({})",
            self.from_id, self.to_id, self.amount, self.status
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_settlement_is_pending() {
        let settlement = Settlement::new("g1", "m1", "m2", 250.0);
        assert_eq!(settlement.status, SettlementStatus::Pending);
        assert!(!settlement.is_completed());
    }

    #[test]
    fn test_status_round_trips_lowercase() {
        let mut settlement = Settlement::new("g1", "m1", "m2", 250.0).with_id("s1");
        settlement.status = SettlementStatus::Completed;
        let json = serde_json::to_value(&settlement).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["fromId"], "m1");
    }
}
