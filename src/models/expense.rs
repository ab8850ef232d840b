use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::entity::Timestamped;
use super::group::default_currency;

/// An expense paid by one member and split between several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub id: String,
    pub group_id: String,
    #[serde(default)]
    pub description: String,
    pub amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub paid_by: String,
    /// member id -> amount owed
    #[serde(default)]
    pub splits: BTreeMap<String, f64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Expense {
    pub fn new(
        group_id: impl Into<String>,
        description: impl Into<String>,
        amount: f64,
        paid_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            group_id: group_id.into(),
            description: description.into(),
            amount,
            currency: default_currency(),
            paid_by: paid_by.into(),
            splits: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_split(mut self, member_id: impl Into<String>, amount: f64) -> Self {
        self.splits.insert(member_id.into(), amount);
        self
    }

    /// Splits the amount equally between the given members.
    pub fn split_equally(mut self, member_ids: &[&str]) -> Self {
        if member_ids.is_empty() {
            return self;
        }
        let share = self.amount / member_ids.len() as f64;
        self.splits = member_ids
            .iter()
            .map(|id| (id.to_string(), share))
            .collect();
        self
    }

    pub fn split_total(&self) -> f64 {
        self.splits.values().sum()
    }
}

impl Timestamped for Expense {
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

impl fmt::Display for Expense {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:.2} {} (paid by {})",
            self.description, self.amount, self.currency, self.paid_by
        )
    }
}
