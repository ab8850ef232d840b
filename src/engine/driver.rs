//! The engine's driver task: trigger handling and the sync cycle.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::conflict::{self, ConflictStrategy};
use crate::connectivity::{Connectivity, Subscription};
use crate::error::{StorageError, SyncError, TransportError};
use crate::models::{
    ChangeKind, EntityKey, EntityVersion, PendingChange, SyncPhase, SyncStatus, Timestamped,
};
use crate::queue::{latest_per_entity, PendingQueue};
use crate::state::{load_record, save_record, StateStore, LAST_SYNC_KEY};
use crate::store::LocalStore;
use crate::transport::realtime::{RealtimeHandle, RealtimeState};
use crate::transport::{Delta, Transport};

use super::{Command, CycleResult, SyncReport, SyncSettings};

const WATERMARK_VERSION: u32 = 1;

pub(super) struct Driver {
    pub store: Arc<dyn LocalStore>,
    pub queue: Arc<PendingQueue>,
    pub transport: Arc<dyn Transport>,
    pub state: Arc<dyn StateStore>,
    pub strategy: Arc<dyn ConflictStrategy>,
    pub settings: SyncSettings,
    pub status: watch::Sender<SyncStatus>,
    /// `None` until loaded from state
    pub watermark: Option<Option<DateTime<Utc>>>,
    pub online: bool,
    pub realtime: Option<Arc<RealtimeHandle>>,
    pub realtime_state: Option<watch::Receiver<RealtimeState>>,
    pub _subscription: Option<Subscription>,
    pub cancel: CancellationToken,
}

/// What the loop has accumulated since the last cycle.
#[derive(Default)]
struct Pending {
    cycle: bool,
    debounce: Option<Instant>,
    waiters: Vec<tokio::sync::oneshot::Sender<CycleResult>>,
}

impl Pending {
    fn due(&self) -> bool {
        self.cycle || !self.waiters.is_empty()
    }
}

impl Driver {
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let cancel = self.cancel.clone();
        let mut pending = Pending::default();
        let mut poll = tokio::time::interval_at(
            Instant::now() + self.settings.poll_interval,
            self.settings.poll_interval,
        );
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if let Err(e) = self.watermark() {
            warn!(error = %e, "Could not load sync watermark");
        }

        loop {
            if pending.due() {
                // Fold everything already waiting into this cycle
                while let Ok(command) = commands.try_recv() {
                    self.handle(command, &mut pending);
                }
                let waiters = std::mem::take(&mut pending.waiters);
                pending.cycle = false;
                pending.debounce = None;

                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    result = self.run_cycle() => result,
                };
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
                poll.reset();
                continue;
            }

            let should_poll = self.should_poll();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command, &mut pending),
                    None => break,
                },
                _ = sleep_until(pending.debounce) => {
                    debug!("Debounce window elapsed");
                    pending.debounce = None;
                    pending.cycle = true;
                }
                state = realtime_changed(&mut self.realtime_state) => match state {
                    Some(RealtimeState::Degraded) => {
                        warn!("Real-time channel degraded, falling back to polling");
                    }
                    Some(state) => debug!(%state, "Real-time state changed"),
                    None => self.realtime_state = None,
                },
                _ = poll.tick(), if should_poll => {
                    debug!("Poll interval elapsed");
                    pending.cycle = true;
                }
            }
        }

        self.shutdown();
    }

    fn handle(&mut self, command: Command, pending: &mut Pending) {
        match command {
            Command::SyncNow(waiter) => pending.waiters.push(waiter),
            Command::LocalChange => {
                self.publish_pending();
                if self.online {
                    pending.debounce = Some(Instant::now() + self.settings.debounce);
                }
            }
            Command::RemoteChange => pending.cycle = true,
            Command::Connectivity(state) => {
                self.online = state.is_online();
                match state {
                    Connectivity::Online => {
                        let queued = self.queue.size().unwrap_or_default();
                        if queued > 0 {
                            info!(queued, "Back online with pending changes");
                            pending.cycle = true;
                        }
                    }
                    Connectivity::Offline => pending.debounce = None,
                }
            }
        }
    }

    fn should_poll(&self) -> bool {
        let realtime_up = self
            .realtime_state
            .as_ref()
            .is_some_and(|s| s.borrow().is_connected());
        self.online && !realtime_up
    }

    fn shutdown(&mut self) {
        self.queue.set_notifier(None);
        self.realtime.take();
        self.status.send_modify(|s| {
            s.is_syncing = false;
            s.phase = SyncPhase::Idle;
        });
        info!("Sync engine stopped");
    }

    fn publish_pending(&self) {
        let count = self.queue.size().unwrap_or_default();
        let degraded = self.queue.persistence_degraded();
        self.status.send_if_modified(|s| {
            let changed = s.pending_count != count || s.persistence_degraded != degraded;
            s.pending_count = count;
            s.persistence_degraded = degraded;
            changed
        });
    }

    fn enter(&self, phase: SyncPhase, progress: u8) {
        self.status.send_modify(|s| {
            s.is_syncing = true;
            s.phase = phase;
            s.progress = progress;
        });
    }

    fn watermark(&mut self) -> Result<Option<DateTime<Utc>>, SyncError> {
        if let Some(watermark) = self.watermark {
            return Ok(watermark);
        }
        let loaded = last_sync(self.state.as_ref())?;
        self.watermark = Some(loaded);
        self.status.send_modify(|s| s.last_sync_at = loaded);
        Ok(loaded)
    }

    async fn run_cycle(&mut self) -> CycleResult {
        let started = Utc::now();
        if self.queue.persistence_degraded() {
            match self.queue.flush() {
                Ok(()) => info!("Pending changes saved again"),
                Err(e) => warn!(error = %e, "Pending changes still not saved"),
            }
        }
        let snapshot = match self.queue.drain() {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(self.fail(e.into(), &[])),
        };
        let ids: Vec<Uuid> = snapshot.iter().map(|c| c.id).collect();

        match self.cycle(started, &snapshot).await {
            Ok(report) => Ok(report),
            Err(e) => Err(self.fail(e, &ids)),
        }
    }

    async fn cycle(
        &mut self,
        started: DateTime<Utc>,
        snapshot: &[PendingChange],
    ) -> CycleResult {
        let watermark = self.watermark()?;
        let mut local = self.local_delta(watermark, snapshot)?;
        let mut report = SyncReport {
            uploaded: local.len(),
            ..SyncReport::default()
        };
        info!(records = local.len(), queued = snapshot.len(), "Starting sync cycle");

        self.enter(SyncPhase::Upload, 0);
        if !local.is_empty() {
            let transport = self.transport.clone();
            let ack = bounded(
                self.settings.request_timeout,
                transport.upload(&local, watermark),
            )
            .await?;
            for problem in &ack.errors {
                warn!(problem = %problem, "Server did not apply a record");
            }
            report.server_errors = ack.errors;
        }

        self.enter(SyncPhase::Download, 33);
        let transport = self.transport.clone();
        let remote = bounded(self.settings.request_timeout, transport.download(watermark)).await?;
        report.downloaded = remote.delta.len();
        report.server_errors.extend(remote.errors);

        self.enter(SyncPhase::Merge, 66);
        let suppressed = self.late_deletions(&mut local, &remote.delta)?;
        let mut plan = conflict::plan(&local, &remote.delta, self.strategy.as_ref());
        for key in &suppressed {
            plan.merged.upserts.remove(key);
        }
        self.store.write(&plan.merged)?;
        report.applied = plan.merged.len();
        for entity in &plan.requeue {
            self.queue.enqueue(ChangeKind::Update, entity.clone())?;
        }
        for unresolved in &plan.unresolved {
            warn!(conflict = %unresolved.conflict, "Conflict needs manual resolution");
        }

        let ids: Vec<Uuid> = snapshot.iter().map(|c| c.id).collect();
        self.queue.remove(&ids)?;
        let advanced = match watermark {
            Some(previous) if previous > started => previous,
            _ => started,
        };
        save_record(
            self.state.as_ref(),
            LAST_SYNC_KEY,
            WATERMARK_VERSION,
            &advanced,
        )?;
        self.watermark = Some(Some(advanced));

        let pending_count = self.queue.size()?;
        let degraded = self.queue.persistence_degraded();
        report.conflicts = plan.conflicts;
        report.unresolved = plan.unresolved;
        let conflicts = report.conflicts.clone();
        self.status.send_modify(|s| {
            s.is_syncing = false;
            s.phase = SyncPhase::Idle;
            s.progress = 100;
            s.last_sync_at = Some(advanced);
            s.last_error = None;
            s.pending_count = pending_count;
            s.persistence_degraded = degraded;
            s.conflicts = conflicts;
        });
        info!(
            uploaded = report.uploaded,
            downloaded = report.downloaded,
            applied = report.applied,
            conflicts = report.conflicts.len(),
            "Sync cycle complete"
        );
        Ok(report)
    }

    /// Local entities changed after the watermark, plus the latest queued
    /// change of every entity: its newest known value, or its deletion.
    fn local_delta(
        &self,
        watermark: Option<DateTime<Utc>>,
        snapshot: &[PendingChange],
    ) -> Result<Delta, SyncError> {
        let current = self.store.read()?;
        let mut entities = current.changed_since(watermark);
        let mut deletions = Vec::new();

        for (key, change) in latest_per_entity(snapshot) {
            match change.tombstone() {
                Some(tombstone) => {
                    entities.remove(&key);
                    deletions.push(tombstone);
                }
                None => {
                    let queued = change.payload.clone();
                    let entity = match current.get(&key) {
                        Some(stored)
                            if stored.effective_timestamp() >= queued.effective_timestamp() =>
                        {
                            stored
                        }
                        _ => queued,
                    };
                    entities.upsert(entity);
                }
            }
        }

        entities.sort_by_id();
        Ok(Delta::new(entities, deletions))
    }

    /// Folds deletions queued after the snapshot into `local` so the merge
    /// cannot bring those records back. A remote version newer than the
    /// deletion is left to the strategy as a conflict; every other remote
    /// upsert of such a record is dropped and its key returned.
    fn late_deletions(
        &self,
        local: &mut Delta,
        remote: &Delta,
    ) -> Result<Vec<EntityKey>, SyncError> {
        let remote_versions = remote.versions();
        let mut suppressed = Vec::new();
        for tombstone in self.queue.tombstones()? {
            let key = tombstone.key();
            if local.deleted.iter().any(|t| t.key() == key) {
                continue;
            }
            match remote_versions.get(&key) {
                Some(EntityVersion::Live(entity))
                    if entity.effective_timestamp() > tombstone.deleted_at =>
                {
                    debug!(%key, "Remote edit is newer than a pending deletion");
                    local.entities.remove(&key);
                    local.deleted.push(tombstone);
                }
                _ => suppressed.push(key),
            }
        }
        Ok(suppressed)
    }

    /// Records a failed cycle. The watermark is left where it was.
    fn fail(&self, error: SyncError, ids: &[Uuid]) -> SyncError {
        warn!(error = %error, "Sync cycle failed");
        if let Err(e) = self.queue.mark_failed(ids) {
            error!(error = %e, "Failed to record retry count");
        }
        let pending_count = self.queue.size().unwrap_or_default();
        let degraded = self.queue.persistence_degraded();
        let message = error.to_string();
        self.status.send_modify(|s| {
            s.is_syncing = false;
            s.phase = SyncPhase::Idle;
            s.progress = 0;
            s.last_error = Some(message);
            s.pending_count = pending_count;
            s.persistence_degraded = degraded;
        });
        error
    }
}

/// The persisted watermark: the start of the last fully successful cycle.
pub fn last_sync(state: &dyn StateStore) -> Result<Option<DateTime<Utc>>, StorageError> {
    load_record(state, LAST_SYNC_KEY, WATERMARK_VERSION)
}

async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, SyncError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TransportError::Timeout.into()),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Next real-time state, or `None` once the channel's task is gone.
async fn realtime_changed(
    state: &mut Option<watch::Receiver<RealtimeState>>,
) -> Option<RealtimeState> {
    match state {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}
