mod change;
mod entity;
mod expense;
mod group;
mod settlement;
mod status;

pub use change::{ChangeKind, PendingChange, MAX_RETRY_COUNT};
pub use entity::{
    EntityKey, EntitySet, EntityType, EntityVersion, MergedChanges, SyncedEntity, Timestamped,
    Tombstone,
};
pub use expense::Expense;
pub use group::{Group, Member};
pub use settlement::{Settlement, SettlementStatus};
pub use status::{SyncPhase, SyncStatus};
