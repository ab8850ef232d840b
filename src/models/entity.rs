//! The tagged union over synchronized entity kinds and the collections
//! built from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::expense::Expense;
use super::group::Group;
use super::settlement::Settlement;

/// Creation and modification timestamps shared by all synced entities.
pub trait Timestamped {
    fn created_at(&self) -> DateTime<Utc>;

    fn updated_at(&self) -> Option<DateTime<Utc>>;

    fn set_updated_at(&mut self, at: DateTime<Utc>);

    /// `updated_at ?? created_at`; the value every conflict comparison uses.
    fn effective_timestamp(&self) -> DateTime<Utc> {
        self.updated_at().unwrap_or_else(|| self.created_at())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Group,
    Expense,
    Settlement,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [EntityType::Group, EntityType::Expense, EntityType::Settlement];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Group => "group",
            EntityType::Expense => "expense",
            EntityType::Settlement => "settlement",
        }
    }

    /// Parse from singular or plural collection name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "group" | "groups" => Some(EntityType::Group),
            "expense" | "expenses" => Some(EntityType::Expense),
            "settlement" | "settlements" => Some(EntityType::Settlement),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one record across all collections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub id: String,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entityType", content = "entity", rename_all = "lowercase")]
pub enum SyncedEntity {
    Group(Group),
    Expense(Expense),
    Settlement(Settlement),
}

impl SyncedEntity {
    pub fn entity_type(&self) -> EntityType {
        match self {
            SyncedEntity::Group(_) => EntityType::Group,
            SyncedEntity::Expense(_) => EntityType::Expense,
            SyncedEntity::Settlement(_) => EntityType::Settlement,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            SyncedEntity::Group(g) => &g.id,
            SyncedEntity::Expense(e) => &e.id,
            SyncedEntity::Settlement(s) => &s.id,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type(), self.id())
    }

    /// Decodes a bare entity body whose type travels separately, as in
    /// real-time messages.
    pub fn from_parts(
        entity_type: EntityType,
        entity: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(match entity_type {
            EntityType::Group => SyncedEntity::Group(serde_json::from_value(entity)?),
            EntityType::Expense => SyncedEntity::Expense(serde_json::from_value(entity)?),
            EntityType::Settlement => SyncedEntity::Settlement(serde_json::from_value(entity)?),
        })
    }

    /// The entity body without the type tag.
    pub fn body(&self) -> serde_json::Value {
        let body = match self {
            SyncedEntity::Group(g) => serde_json::to_value(g),
            SyncedEntity::Expense(e) => serde_json::to_value(e),
            SyncedEntity::Settlement(s) => serde_json::to_value(s),
        };
        body.unwrap_or(serde_json::Value::Null)
    }

    /// Marks the entity as modified at `at`.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.set_updated_at(at);
    }
}

impl Timestamped for SyncedEntity {
    fn created_at(&self) -> DateTime<Utc> {
        match self {
            SyncedEntity::Group(g) => g.created_at(),
            SyncedEntity::Expense(e) => e.created_at(),
            SyncedEntity::Settlement(s) => s.created_at(),
        }
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        match self {
            SyncedEntity::Group(g) => g.updated_at(),
            SyncedEntity::Expense(e) => e.updated_at(),
            SyncedEntity::Settlement(s) => s.updated_at(),
        }
    }

    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        match self {
            SyncedEntity::Group(g) => g.set_updated_at(at),
            SyncedEntity::Expense(e) => e.set_updated_at(at),
            SyncedEntity::Settlement(s) => s.set_updated_at(at),
        }
    }
}

impl From<Group> for SyncedEntity {
    fn from(group: Group) -> Self {
        SyncedEntity::Group(group)
    }
}

impl From<Expense> for SyncedEntity {
    fn from(expense: Expense) -> Self {
        SyncedEntity::Expense(expense)
    }
}

impl From<Settlement> for SyncedEntity {
    fn from(settlement: Settlement) -> Self {
        SyncedEntity::Settlement(settlement)
    }
}

/// A deletion record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub entity_type: EntityType,
    pub id: String,
    pub deleted_at: DateTime<Utc>,
}

impl Tombstone {
    pub fn new(entity_type: EntityType, id: impl Into<String>, deleted_at: DateTime<Utc>) -> Self {
        Self {
            entity_type,
            id: id.into(),
            deleted_at,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.id.clone())
    }
}

/// One side of a record: either a live entity or its deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "lowercase")]
pub enum EntityVersion {
    Live(SyncedEntity),
    Deleted(Tombstone),
}

impl EntityVersion {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EntityVersion::Live(entity) => entity.effective_timestamp(),
            EntityVersion::Deleted(tombstone) => tombstone.deleted_at,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, EntityVersion::Deleted(_))
    }

    pub fn live(&self) -> Option<&SyncedEntity> {
        match self {
            EntityVersion::Live(entity) => Some(entity),
            EntityVersion::Deleted(_) => None,
        }
    }
}

trait Identified: Timestamped {
    fn ident(&self) -> &str;
}

impl Identified for Group {
    fn ident(&self) -> &str {
        &self.id
    }
}

impl Identified for Expense {
    fn ident(&self) -> &str {
        &self.id
    }
}

impl Identified for Settlement {
    fn ident(&self) -> &str {
        &self.id
    }
}

fn upsert_into<T: Identified>(items: &mut Vec<T>, item: T) {
    match items.iter_mut().find(|i| i.ident() == item.ident()) {
        Some(slot) => *slot = item,
        None => items.push(item),
    }
}

fn remove_from<T: Identified>(items: &mut Vec<T>, id: &str) -> Option<T> {
    let pos = items.iter().position(|i| i.ident() == id)?;
    Some(items.remove(pos))
}

fn stamp_of<T: Identified>(items: &[T], id: &str) -> Option<DateTime<Utc>> {
    items
        .iter()
        .find(|i| i.ident() == id)
        .map(|i| i.effective_timestamp())
}

/// The three synchronized collections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitySet {
    pub groups: Vec<Group>,
    pub expenses: Vec<Expense>,
    pub settlements: Vec<Settlement>,
}

impl EntitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.groups.len() + self.expenses.len() + self.settlements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entities, groups first, in collection order.
    pub fn entities(&self) -> Vec<SyncedEntity> {
        let groups = self.groups.iter().cloned().map(SyncedEntity::Group);
        let expenses = self.expenses.iter().cloned().map(SyncedEntity::Expense);
        let settlements = self.settlements.iter().cloned().map(SyncedEntity::Settlement);
        groups.chain(expenses).chain(settlements).collect()
    }

    pub fn keys(&self) -> BTreeSet<EntityKey> {
        let groups = self.groups.iter().map(|g| EntityKey::new(EntityType::Group, &g.id));
        let expenses = self.expenses.iter().map(|e| EntityKey::new(EntityType::Expense, &e.id));
        let settlements = self
            .settlements
            .iter()
            .map(|s| EntityKey::new(EntityType::Settlement, &s.id));
        groups.chain(expenses).chain(settlements).collect()
    }

    pub fn get(&self, key: &EntityKey) -> Option<SyncedEntity> {
        let id = key.id.as_str();
        match key.entity_type {
            EntityType::Group => self
                .groups
                .iter()
                .find(|g| g.id == id)
                .cloned()
                .map(SyncedEntity::Group),
            EntityType::Expense => self
                .expenses
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .map(SyncedEntity::Expense),
            EntityType::Settlement => self
                .settlements
                .iter()
                .find(|s| s.id == id)
                .cloned()
                .map(SyncedEntity::Settlement),
        }
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.timestamp_of(key).is_some()
    }

    /// Effective timestamp of the stored version, if any.
    pub fn timestamp_of(&self, key: &EntityKey) -> Option<DateTime<Utc>> {
        match key.entity_type {
            EntityType::Group => stamp_of(&self.groups, &key.id),
            EntityType::Expense => stamp_of(&self.expenses, &key.id),
            EntityType::Settlement => stamp_of(&self.settlements, &key.id),
        }
    }

    /// Inserts or replaces the record with the same id.
    pub fn upsert(&mut self, entity: SyncedEntity) {
        match entity {
            SyncedEntity::Group(g) => upsert_into(&mut self.groups, g),
            SyncedEntity::Expense(e) => upsert_into(&mut self.expenses, e),
            SyncedEntity::Settlement(s) => upsert_into(&mut self.settlements, s),
        }
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<SyncedEntity> {
        match key.entity_type {
            EntityType::Group => remove_from(&mut self.groups, &key.id).map(SyncedEntity::Group),
            EntityType::Expense => {
                remove_from(&mut self.expenses, &key.id).map(SyncedEntity::Expense)
            }
            EntityType::Settlement => {
                remove_from(&mut self.settlements, &key.id).map(SyncedEntity::Settlement)
            }
        }
    }

    /// Entities whose effective timestamp is strictly after `since`.
    /// With no watermark every entity counts as changed.
    pub fn changed_since(&self, since: Option<DateTime<Utc>>) -> EntitySet {
        let changed = |ts: DateTime<Utc>| since.map_or(true, |w| ts > w);
        EntitySet {
            groups: self
                .groups
                .iter()
                .filter(|g| changed(g.effective_timestamp()))
                .cloned()
                .collect(),
            expenses: self
                .expenses
                .iter()
                .filter(|e| changed(e.effective_timestamp()))
                .cloned()
                .collect(),
            settlements: self
                .settlements
                .iter()
                .filter(|s| changed(s.effective_timestamp()))
                .cloned()
                .collect(),
        }
    }

    pub fn sort_by_id(&mut self) {
        self.groups.sort_by(|a, b| a.id.cmp(&b.id));
        self.expenses.sort_by(|a, b| a.id.cmp(&b.id));
        self.settlements.sort_by(|a, b| a.id.cmp(&b.id));
    }

    /// Applies merged changes, never replacing a record with an older
    /// version. Returns the number of records touched.
    pub fn apply(&mut self, changes: &MergedChanges) -> usize {
        let mut touched = 0;
        for entity in changes.upserts.entities() {
            let key = entity.key();
            let newer_or_equal = self
                .timestamp_of(&key)
                .map_or(true, |current| entity.effective_timestamp() >= current);
            if newer_or_equal {
                self.upsert(entity);
                touched += 1;
            }
        }
        for tombstone in &changes.removals {
            let key = tombstone.key();
            match self.timestamp_of(&key) {
                Some(current) if current <= tombstone.deleted_at => {
                    self.remove(&key);
                    touched += 1;
                }
                _ => {}
            }
        }
        touched
    }
}

impl FromIterator<SyncedEntity> for EntitySet {
    fn from_iter<I: IntoIterator<Item = SyncedEntity>>(iter: I) -> Self {
        let mut set = EntitySet::new();
        for entity in iter {
            set.upsert(entity);
        }
        set
    }
}

/// What a sync cycle writes back into the local store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedChanges {
    pub upserts: EntitySet,
    pub removals: Vec<Tombstone>,
}

impl MergedChanges {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.upserts.len() + self.removals.len()
    }

    /// Sorts every collection so equal inputs serialize identically.
    pub fn normalize(&mut self) {
        self.upserts.sort_by_id();
        self.removals.sort_by(|a, b| a.key().cmp(&b.key()));
    }
}
