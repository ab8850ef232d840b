//! Error taxonomy for the sync engine.
//!
//! Errors are `Clone` so one cycle outcome can be delivered to every caller
//! whose trigger was coalesced into that cycle.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::conflict::SyncConflict;
pub use crate::transport::TransportError;

/// Persistence read/write failures.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("I/O error for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("Failed to encode '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: Arc<serde_json::Error>,
    },

    #[error("Failed to decode '{key}': {source}")]
    Decode {
        key: String,
        #[source]
        source: Arc<serde_json::Error>,
    },

    #[error("Unsupported version {found} for '{key}' (expected {expected})")]
    UnsupportedVersion { key: String, found: u32, expected: u32 },

    #[error("Invalid state key: {0}")]
    InvalidKey(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn encode(key: impl Into<String>, source: serde_json::Error) -> Self {
        StorageError::Encode {
            key: key.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn decode(key: impl Into<String>, source: serde_json::Error) -> Self {
        StorageError::Decode {
            key: key.into(),
            source: Arc::new(source),
        }
    }
}

/// Missing or invalid endpoint/credential settings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Sync endpoint not configured. Set sync.endpoint or SPLITSYNC_ENDPOINT.")]
    MissingEndpoint,

    #[error("User id not configured. Set user_id or SPLITSYNC_USER_ID.")]
    MissingUserId,

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// An irreconcilable conflict. Reported alongside a cycle's results,
/// never returned as the cycle's error.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictError {
    pub conflict: SyncConflict,
}

impl std::fmt::Display for ConflictError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Unresolved {} conflict on {} {}",
            self.conflict.kind, self.conflict.entity_type, self.conflict.local_id
        )
    }
}

impl std::error::Error for ConflictError {}

/// Umbrella error for engine operations.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Sync engine has been shut down")]
    ShutDown,
}

impl SyncError {
    /// True for failures a later attempt may not hit again.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transport(e) => e.is_transient(),
            SyncError::Storage(_) | SyncError::Configuration(_) | SyncError::ShutDown => false,
        }
    }
}
