use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::conflict::SyncConflict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    #[default]
    Idle,
    Upload,
    Download,
    Merge,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPhase::Idle => write!(f, "idle"),
            SyncPhase::Upload => write!(f, "uploading"),
            SyncPhase::Download => write!(f, "downloading"),
            SyncPhase::Merge => write!(f, "merging"),
        }
    }
}

/// Observable state of one sync engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub pending_count: usize,
    /// 0-100
    pub progress: u8,
    pub phase: SyncPhase,
    /// Conflicts surfaced by the last completed cycle.
    pub conflicts: Vec<SyncConflict>,
    /// The pending queue could not be saved; queued changes would not
    /// survive a restart.
    pub persistence_degraded: bool,
}

impl SyncStatus {
    pub fn is_idle(&self) -> bool {
        self.phase == SyncPhase::Idle && !self.is_syncing
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_syncing {
            write!(f, "{} ({}%)", self.phase, self.progress)?;
        } else {
            write!(f, "idle")?;
        }
        write!(f, ", {} pending", self.pending_count)?;
        if let Some(at) = self.last_sync_at {
            write!(f, ", last sync {}", at.format("%Y-%m-%d %H:%M:%S"))?;
        }
        if let Some(err) = &self.last_error {
            write!(f, ", last error: {}", err)?;
        }
        if self.persistence_degraded {
            write!(f, ", queue not saved")?;
        }
        Ok(())
    }
}
