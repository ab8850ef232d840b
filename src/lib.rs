//! Splitsync Library
//!
//! Offline-first synchronization of groups, expenses and settlements
//! between devices and a shared server.

pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod models;
pub mod queue;
pub mod server;
pub mod state;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{Config, ConfigError, SyncConfig};
pub use conflict::{ConflictKind, ConflictStrategy, FieldMerge, LastWriterWins, SyncConflict};
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use engine::{SyncEngine, SyncHandle, SyncReport, SyncSettings};
pub use error::{ConfigurationError, ConflictError, StorageError, SyncError, TransportError};
pub use models::{
    ChangeKind, EntityKey, EntitySet, EntityType, Expense, Group, Member, PendingChange,
    Settlement, SettlementStatus, SyncPhase, SyncStatus, SyncedEntity, Tombstone,
};
pub use queue::PendingQueue;
pub use store::{FileStore, LocalStore, MemoryStore};
pub use transport::{Delta, RestTransport, Transport};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
