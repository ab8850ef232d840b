//! Conflict detection and resolution between a local and a remote delta.
//!
//! Planning is a pure function of the two deltas and the strategy: inputs
//! are indexed by key and the output is sorted, so two devices holding the
//! same pair of versions produce byte-identical merges.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::ConflictError;
use crate::models::{
    EntityKey, EntityType, EntityVersion, Expense, Group, MergedChanges, SyncedEntity, Timestamped,
};
use crate::transport::Delta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    BothModified,
    DeletedLocally,
    DeletedRemotely,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::BothModified => write!(f, "both_modified"),
            ConflictKind::DeletedLocally => write!(f, "deleted_locally"),
            ConflictKind::DeletedRemotely => write!(f, "deleted_remotely"),
        }
    }
}

/// Two diverging versions of one record seen in a single cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub entity_type: EntityType,
    pub local_id: String,
    pub remote_id: String,
    pub local_version: EntityVersion,
    pub remote_version: EntityVersion,
    pub kind: ConflictKind,
}

impl SyncConflict {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.local_id.clone())
    }

    /// Classifies a pair of versions of the same record, if they conflict.
    pub fn classify(key: &EntityKey, local: &EntityVersion, remote: &EntityVersion) -> Option<Self> {
        let kind = match (local, remote) {
            (EntityVersion::Live(l), EntityVersion::Live(r)) => {
                if l.effective_timestamp() == r.effective_timestamp() {
                    return None;
                }
                ConflictKind::BothModified
            }
            (EntityVersion::Deleted(_), EntityVersion::Live(_)) => ConflictKind::DeletedLocally,
            (EntityVersion::Live(_), EntityVersion::Deleted(_)) => ConflictKind::DeletedRemotely,
            (EntityVersion::Deleted(_), EntityVersion::Deleted(_)) => return None,
        };
        Some(Self {
            entity_type: key.entity_type,
            local_id: key.id.clone(),
            remote_id: key.id.clone(),
            local_version: local.clone(),
            remote_version: remote.clone(),
            kind,
        })
    }
}

impl fmt::Display for SyncConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}, local {}, remote {})",
            self.entity_type,
            self.local_id,
            self.kind,
            self.local_version.timestamp().format("%Y-%m-%d %H:%M:%S"),
            self.remote_version.timestamp().format("%Y-%m-%d %H:%M:%S"),
        )
    }
}

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
    /// A new version combining both sides; it is written locally and
    /// uploaded on the next cycle.
    Merged(SyncedEntity),
    /// Left for the user; the local side is not touched.
    Unresolved,
}

pub trait ConflictStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(&self, conflict: &SyncConflict) -> Resolution;
}

/// Keeps the strictly later version; ties go to the remote. Deletion
/// conflicts are left unresolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl ConflictStrategy for LastWriterWins {
    fn name(&self) -> &'static str {
        "last-writer-wins"
    }

    fn resolve(&self, conflict: &SyncConflict) -> Resolution {
        match conflict.kind {
            ConflictKind::BothModified => latest(conflict),
            ConflictKind::DeletedLocally | ConflictKind::DeletedRemotely => Resolution::Unresolved,
        }
    }
}

fn latest(conflict: &SyncConflict) -> Resolution {
    if conflict.local_version.timestamp() > conflict.remote_version.timestamp() {
        Resolution::KeepLocal
    } else {
        Resolution::KeepRemote
    }
}

/// Unions expense splits and group members; everything else falls back
/// to [`LastWriterWins`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldMerge;

impl ConflictStrategy for FieldMerge {
    fn name(&self) -> &'static str {
        "field-merge"
    }

    fn resolve(&self, conflict: &SyncConflict) -> Resolution {
        let fallback = LastWriterWins.resolve(conflict);
        let (Some(local), Some(remote)) =
            (conflict.local_version.live(), conflict.remote_version.live())
        else {
            return fallback;
        };
        let local_wins = fallback == Resolution::KeepLocal;

        let merged = match (local, remote) {
            (SyncedEntity::Expense(l), SyncedEntity::Expense(r)) => {
                let (winner, loser) = if local_wins { (l, r) } else { (r, l) };
                merge_expense(winner, loser).map(SyncedEntity::Expense)
            }
            (SyncedEntity::Group(l), SyncedEntity::Group(r)) => {
                let (winner, loser) = if local_wins { (l, r) } else { (r, l) };
                merge_group(winner, loser).map(SyncedEntity::Group)
            }
            _ => None,
        };

        match merged {
            Some(mut entity) => {
                // Strictly newer than both sides so the remote accepts it.
                let stamp = local.effective_timestamp().max(remote.effective_timestamp())
                    + Duration::milliseconds(1);
                entity.touch(stamp);
                Resolution::Merged(entity)
            }
            None => fallback,
        }
    }
}

/// Winner's fields plus any split only the loser has. `None` when the
/// loser adds nothing.
fn merge_expense(winner: &Expense, loser: &Expense) -> Option<Expense> {
    let extra: Vec<(&String, &f64)> = loser
        .splits
        .iter()
        .filter(|(id, _)| !winner.splits.contains_key(*id))
        .collect();
    if extra.is_empty() {
        return None;
    }
    let mut merged = winner.clone();
    for (id, amount) in extra {
        merged.splits.insert(id.clone(), *amount);
    }
    Some(merged)
}

fn merge_group(winner: &Group, loser: &Group) -> Option<Group> {
    let extra: Vec<_> = loser
        .members
        .iter()
        .filter(|m| winner.member(&m.id).is_none())
        .cloned()
        .collect();
    if extra.is_empty() {
        return None;
    }
    let mut merged = winner.clone();
    merged.members.extend(extra);
    Some(merged)
}

/// What one cycle writes back and reports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    /// Upserts and removals for the local store, sorted by key.
    pub merged: MergedChanges,
    /// Every conflict seen, sorted by key.
    pub conflicts: Vec<SyncConflict>,
    pub unresolved: Vec<ConflictError>,
    /// Merged versions that still need to reach the remote.
    pub requeue: Vec<SyncedEntity>,
}

/// Every conflict between the two deltas, sorted by key.
pub fn detect(local: &Delta, remote: &Delta) -> Vec<SyncConflict> {
    let local_versions = local.versions();
    remote
        .versions()
        .iter()
        .filter_map(|(key, remote)| {
            let local = local_versions.get(key)?;
            SyncConflict::classify(key, local, remote)
        })
        .collect()
}

/// Reconciles `remote` against `local` with `strategy`.
///
/// Remote-only records are taken as they are. Records present on both sides
/// without conflicting are taken from the remote, so equal timestamps
/// resolve to the remote copy.
pub fn plan(local: &Delta, remote: &Delta, strategy: &dyn ConflictStrategy) -> MergePlan {
    let local_versions = local.versions();
    let remote_versions: BTreeMap<EntityKey, EntityVersion> = remote.versions();
    let mut plan = MergePlan::default();

    for (key, remote_version) in &remote_versions {
        let Some(local_version) = local_versions.get(key) else {
            take(&mut plan.merged, remote_version);
            continue;
        };
        let Some(conflict) = SyncConflict::classify(key, local_version, remote_version) else {
            if local_version != remote_version {
                take(&mut plan.merged, remote_version);
            }
            continue;
        };

        match strategy.resolve(&conflict) {
            Resolution::KeepLocal => {}
            Resolution::KeepRemote => take(&mut plan.merged, remote_version),
            Resolution::Merged(entity) => {
                plan.merged.upserts.upsert(entity.clone());
                plan.requeue.push(entity);
            }
            Resolution::Unresolved => plan.unresolved.push(ConflictError {
                conflict: conflict.clone(),
            }),
        }
        plan.conflicts.push(conflict);
    }

    plan.merged.normalize();
    plan
}

fn take(merged: &mut MergedChanges, version: &EntityVersion) {
    match version {
        EntityVersion::Live(entity) => merged.upserts.upsert(entity.clone()),
        EntityVersion::Deleted(tombstone) => merged.removals.push(tombstone.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntitySet, Member, Settlement, Tombstone};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn expense(id: &str, amount: f64, updated: i64) -> Expense {
        let mut e = Expense::new("g1", "Dinner", amount, "m1").with_id(id);
        e.created_at = at(0);
        e.updated_at = Some(at(updated));
        e
    }

    fn delta(entities: Vec<SyncedEntity>, deleted: Vec<Tombstone>) -> Delta {
        Delta::new(entities.into_iter().collect::<EntitySet>(), deleted)
    }

    fn key(id: &str) -> EntityKey {
        EntityKey::new(EntityType::Expense, id)
    }

    #[test]
    fn test_detect_classifies_all_kinds() {
        let local = delta(
            vec![expense("a", 1.0, 5).into(), expense("c", 1.0, 5).into(), expense("d", 1.0, 5).into()],
            vec![Tombstone::new(EntityType::Expense, "b", at(5))],
        );
        let remote = delta(
            vec![expense("a", 2.0, 6).into(), expense("b", 2.0, 6).into(), expense("d", 1.0, 5).into()],
            vec![Tombstone::new(EntityType::Expense, "c", at(6))],
        );

        let kinds: Vec<(String, ConflictKind)> = detect(&local, &remote)
            .into_iter()
            .map(|c| (c.local_id, c.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("a".to_string(), ConflictKind::BothModified),
                ("b".to_string(), ConflictKind::DeletedLocally),
                ("c".to_string(), ConflictKind::DeletedRemotely),
            ]
        );
    }

    #[test]
    fn test_last_writer_wins_prefers_later_local() {
        let local = delta(vec![expense("e1", 10.0, 9).into()], vec![]);
        let remote = delta(vec![expense("e1", 20.0, 4).into()], vec![]);

        let plan = plan(&local, &remote, &LastWriterWins);
        assert_eq!(plan.conflicts.len(), 1);
        assert!(plan.merged.is_empty());
        assert!(plan.unresolved.is_empty());
    }

    #[test]
    fn test_concurrent_edits_converge_on_later_version() {
        // Device A edited at T5, device B at T6.
        let t5 = expense("e1", 500.0, 5);
        let t6 = expense("e1", 600.0, 6);

        let on_a = plan(
            &delta(vec![t5.clone().into()], vec![]),
            &delta(vec![t6.clone().into()], vec![]),
            &LastWriterWins,
        );
        assert_eq!(on_a.merged.upserts.expenses, vec![t6.clone()]);

        let on_b = plan(
            &delta(vec![t6.into()], vec![]),
            &delta(vec![t5.into()], vec![]),
            &LastWriterWins,
        );
        assert!(on_b.merged.is_empty());
        assert_eq!(on_b.conflicts[0].kind, ConflictKind::BothModified);
    }

    #[test]
    fn test_equal_timestamps_take_remote() {
        let local = delta(vec![expense("e1", 1.0, 5).into()], vec![]);
        let remote_copy = expense("e1", 2.0, 5);
        let remote = delta(vec![remote_copy.clone().into()], vec![]);

        let plan = plan(&local, &remote, &LastWriterWins);
        assert!(plan.conflicts.is_empty());
        assert_eq!(plan.merged.upserts.expenses, vec![remote_copy]);
    }

    #[test]
    fn test_remote_update_of_local_delete_is_surfaced() {
        let local = delta(vec![], vec![Tombstone::new(EntityType::Expense, "e1", at(5))]);
        let remote = delta(vec![expense("e1", 75.0, 8).into()], vec![]);

        let plan = plan(&local, &remote, &LastWriterWins);
        assert!(plan.merged.is_empty());
        assert_eq!(plan.unresolved.len(), 1);
        let conflict = &plan.unresolved[0].conflict;
        assert_eq!(conflict.kind, ConflictKind::DeletedLocally);
        assert_eq!(conflict.key(), key("e1"));
        assert!(conflict.local_version.is_deleted());
    }

    #[test]
    fn test_remote_only_records_and_tombstones_are_taken() {
        let local = delta(vec![expense("mine", 1.0, 1).into()], vec![]);
        let remote = delta(
            vec![expense("theirs", 2.0, 2).into()],
            vec![Tombstone::new(EntityType::Expense, "gone", at(3))],
        );

        let plan = plan(&local, &remote, &LastWriterWins);
        assert_eq!(plan.merged.upserts.expenses.len(), 1);
        assert_eq!(plan.merged.upserts.expenses[0].id, "theirs");
        assert_eq!(plan.merged.removals[0].id, "gone");
        assert!(plan.conflicts.is_empty());
    }

    #[test]
    fn test_plan_is_deterministic_under_input_order() {
        let mut settlement = Settlement::new("g1", "m1", "m2", 10.0).with_id("s1");
        settlement.created_at = at(1);
        let base: Vec<SyncedEntity> = vec![
            expense("e1", 1.0, 5).into(),
            expense("e2", 2.0, 5).into(),
            expense("e3", 3.0, 7).into(),
            settlement.into(),
        ];
        let entities = |reverse: bool| {
            let mut items = base.clone();
            if reverse {
                items.reverse();
            }
            items
        };
        let tombstones = |reverse: bool| {
            let mut items = vec![
                Tombstone::new(EntityType::Expense, "x1", at(5)),
                Tombstone::new(EntityType::Group, "x2", at(5)),
            ];
            if reverse {
                items.reverse();
            }
            items
        };
        let local = delta(vec![expense("e1", 9.0, 5).into(), expense("e3", 9.0, 6).into()], vec![]);

        let first = plan(&local, &delta(entities(false), tombstones(false)), &LastWriterWins);
        let second = plan(&local, &delta(entities(true), tombstones(true)), &LastWriterWins);

        assert_eq!(
            serde_json::to_vec(&first.merged).unwrap(),
            serde_json::to_vec(&second.merged).unwrap()
        );
        assert_eq!(first.conflicts, second.conflicts);
    }

    #[test]
    fn test_field_merge_unions_splits() {
        let local = expense("e1", 300.0, 5).with_split("m1", 100.0).with_split("m2", 200.0);
        let remote = expense("e1", 300.0, 6).with_split("m1", 150.0).with_split("m3", 150.0);

        let plan = plan(
            &delta(vec![local.into()], vec![]),
            &delta(vec![remote.into()], vec![]),
            &FieldMerge,
        );

        assert_eq!(plan.requeue.len(), 1);
        let merged = &plan.merged.upserts.expenses[0];
        assert_eq!(merged.splits["m1"], 150.0);
        assert_eq!(merged.splits["m2"], 200.0);
        assert_eq!(merged.splits["m3"], 150.0);
        assert!(merged.effective_timestamp() > at(6));
    }

    #[test]
    fn test_field_merge_unions_group_members() {
        let mut local = Group::new("Flat").with_id("g1").with_members(vec![
            Member::new("m1", "Asha"),
            Member::new("m2", "Ravi"),
        ]);
        local.updated_at = Some(at(8));
        let mut remote = local.clone().with_members(vec![Member::new("m3", "Meera")]);
        remote.updated_at = Some(at(4));

        let resolution = FieldMerge.resolve(&SyncConflict {
            entity_type: EntityType::Group,
            local_id: "g1".to_string(),
            remote_id: "g1".to_string(),
            local_version: EntityVersion::Live(local.into()),
            remote_version: EntityVersion::Live(remote.into()),
            kind: ConflictKind::BothModified,
        });

        let Resolution::Merged(SyncedEntity::Group(group)) = resolution else {
            panic!("expected merged group, got {:?}", resolution);
        };
        let ids: Vec<&str> = group.members.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_field_merge_falls_back_without_new_fields() {
        let local = expense("e1", 300.0, 5).with_split("m1", 300.0);
        let remote = expense("e1", 250.0, 6).with_split("m1", 250.0);

        let plan = plan(
            &delta(vec![local.into()], vec![]),
            &delta(vec![remote.clone().into()], vec![]),
            &FieldMerge,
        );
        assert!(plan.requeue.is_empty());
        assert_eq!(plan.merged.upserts.expenses, vec![remote]);
    }

    #[test]
    fn test_field_merge_leaves_deletions_unresolved() {
        let local = delta(vec![expense("e1", 1.0, 5).into()], vec![]);
        let remote = delta(vec![], vec![Tombstone::new(EntityType::Expense, "e1", at(9))]);

        let plan = plan(&local, &remote, &FieldMerge);
        assert_eq!(plan.unresolved.len(), 1);
        assert_eq!(plan.unresolved[0].conflict.kind, ConflictKind::DeletedRemotely);
        assert!(plan.merged.is_empty());
    }
}
