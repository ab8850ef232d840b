//! Sync orchestration.
//!
//! A [`SyncEngine`] is built from its collaborators and started once; the
//! running engine is a single driver task that owns the watermark and the
//! published [`SyncStatus`]. Callers talk to it through a cloneable
//! [`SyncHandle`].
//!
//! ```text
//!  record_local_change ──► queue + store ──► debounce ─┐
//!  sync_now / retry_sync ──────────────────────────────┤
//!  connectivity Online (pending > 0) ──────────────────┼──► cycle: upload ─► download ─► merge
//!  real-time sync_update ──────────────────────────────┤
//!  poll (online, no real-time) ────────────────────────┘
//! ```
//!
//! Triggers that arrive while a cycle runs coalesce into at most one
//! follow-up cycle.

mod driver;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, SyncConfig};
use crate::conflict::{ConflictStrategy, LastWriterWins, SyncConflict};
use crate::connectivity::{Connectivity, ConnectivityMonitor, HttpProbe, Probe};
use crate::error::{ConflictError, SyncError};
use crate::models::{ChangeKind, PendingChange, SyncStatus, SyncedEntity};
use crate::queue::{ChangeNotifier, PendingQueue};
use crate::state::{FileStateStore, StateStore};
use crate::store::{FileStore, LocalStore};
use crate::transport::realtime::{self, RealtimeConfig};
use crate::transport::{RestTransport, Transport};

use driver::Driver;
pub use driver::last_sync;

/// Delay before the first `retry_sync` retry; doubles on each attempt.
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Timing knobs of one engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    /// Poll period while online without a real-time channel
    pub poll_interval: Duration,
    /// Quiet period after a local change before syncing
    pub debounce: Duration,
    /// Attempts made by `retry_sync`
    pub max_retries: u32,
    /// Bound on each upload and download
    pub request_timeout: Duration,
    pub retry_base_delay: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            debounce: Duration::from_secs(2),
            max_retries: 3,
            request_timeout: Duration::from_secs(30),
            retry_base_delay: RETRY_BASE_DELAY,
        }
    }
}

impl SyncSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            debounce: config.debounce(),
            max_retries: config.max_retries.max(1),
            request_timeout: config.request_timeout(),
            retry_base_delay: RETRY_BASE_DELAY,
        }
    }
}

/// Outcome of one successful cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Records sent, live and deleted
    pub uploaded: usize,
    /// Records received, live and deleted
    pub downloaded: usize,
    /// Upserts and removals written to the local store
    pub applied: usize,
    pub conflicts: Vec<SyncConflict>,
    pub unresolved: Vec<ConflictError>,
    /// Per-record problems the server reported
    pub server_errors: Vec<String>,
}

pub(crate) type CycleResult = Result<SyncReport, SyncError>;

pub(crate) enum Command {
    SyncNow(oneshot::Sender<CycleResult>),
    LocalChange,
    RemoteChange,
    Connectivity(Connectivity),
}

pub struct SyncEngineBuilder {
    store: Arc<dyn LocalStore>,
    queue: Arc<PendingQueue>,
    transport: Arc<dyn Transport>,
    state: Arc<dyn StateStore>,
    settings: SyncSettings,
    strategy: Arc<dyn ConflictStrategy>,
    connectivity: Option<ConnectivityMonitor>,
    probe: Option<(Arc<dyn Probe>, Duration)>,
    realtime: Option<(RealtimeConfig, String)>,
}

impl SyncEngineBuilder {
    pub fn settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn ConflictStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Without a monitor the engine assumes it is always online.
    pub fn connectivity(mut self, monitor: ConnectivityMonitor) -> Self {
        self.connectivity = Some(monitor);
        self
    }

    /// Probes reachability every `interval` once started. Needs a monitor.
    pub fn probe(mut self, probe: Arc<dyn Probe>, interval: Duration) -> Self {
        self.probe = Some((probe, interval));
        self
    }

    pub fn realtime(mut self, config: RealtimeConfig, user_id: impl Into<String>) -> Self {
        self.realtime = Some((config, user_id.into()));
        self
    }

    pub fn build(self) -> SyncEngine {
        SyncEngine { parts: self }
    }
}

/// A configured, not yet running engine.
pub struct SyncEngine {
    parts: SyncEngineBuilder,
}

impl SyncEngine {
    pub fn builder(
        store: Arc<dyn LocalStore>,
        queue: Arc<PendingQueue>,
        transport: Arc<dyn Transport>,
        state: Arc<dyn StateStore>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder {
            store,
            queue,
            transport,
            state,
            settings: SyncSettings::default(),
            strategy: Arc::new(LastWriterWins),
            connectivity: None,
            probe: None,
            realtime: None,
        }
    }

    /// File-backed store and state under the configured data directory,
    /// REST transport, health probing, and real-time when a URL is known.
    pub fn from_config(config: &Config) -> Result<Self, SyncError> {
        // Shared by uploads and the real-time connection so the server can
        // tell this engine's own changes apart from other devices'.
        let device_id = uuid::Uuid::new_v4().to_string();
        let transport = RestTransport::from_config(config)?.with_device_id(device_id.clone());
        let state: Arc<dyn StateStore> = Arc::new(FileStateStore::new(config.state_dir()));
        let queue = Arc::new(PendingQueue::new(state.clone()));
        let store: Arc<dyn LocalStore> = Arc::new(FileStore::new(config.data_dir.value.clone()));

        let probe: Arc<dyn Probe> = Arc::new(HttpProbe::new(transport.endpoint()));
        let mut builder = Self::builder(store, queue, Arc::new(transport), state)
            .settings(SyncSettings::from_config(&config.sync))
            .connectivity(ConnectivityMonitor::new(Connectivity::Online))
            .probe(probe, config.sync.connectivity_interval());

        if let Some(url) = config.sync.realtime_url() {
            let realtime = RealtimeConfig::new(url)
                .with_api_key(config.sync.api_key.clone())
                .with_device_id(device_id);
            builder = builder.realtime(realtime, config.user_id()?);
        }
        Ok(builder.build())
    }

    /// Replays queued changes onto the store, then spawns the driver task.
    /// Must be called within a tokio runtime.
    pub fn start(self) -> SyncHandle {
        let parts = self.parts;
        match parts.queue.replay(parts.store.as_ref()) {
            Ok(0) => {}
            Ok(count) => info!(count, "Restored queued changes to the local store"),
            Err(e) => warn!(error = %e, "Could not replay queued changes"),
        }
        let cancel = CancellationToken::new();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let realtime = parts.realtime.map(|(config, user_id)| {
            let tx = commands_tx.clone();
            let handle = realtime::connect(
                config,
                &user_id,
                move |message| {
                    debug!(?message, "Remote change announced");
                    let _ = tx.send(Command::RemoteChange);
                },
                cancel.child_token(),
            );
            Arc::new(handle)
        });
        if let Some(handle) = &realtime {
            let notifier: Arc<dyn ChangeNotifier> = handle.clone();
            parts.queue.set_notifier(Some(notifier));
        }

        let subscription = parts.connectivity.as_ref().map(|monitor| {
            let tx = commands_tx.clone();
            monitor.subscribe(move |state| {
                let _ = tx.send(Command::Connectivity(state));
            })
        });
        if let (Some(monitor), Some((probe, interval))) = (&parts.connectivity, parts.probe) {
            monitor.spawn_probe(probe, interval, cancel.child_token());
        }

        let initial = SyncStatus {
            pending_count: parts.queue.size().unwrap_or_default(),
            persistence_degraded: parts.queue.persistence_degraded(),
            ..SyncStatus::default()
        };
        let (status_tx, status_rx) = watch::channel(initial);

        let driver = Driver {
            store: parts.store.clone(),
            queue: parts.queue.clone(),
            transport: parts.transport,
            state: parts.state,
            strategy: parts.strategy,
            settings: parts.settings.clone(),
            status: status_tx,
            watermark: None,
            online: parts
                .connectivity
                .as_ref()
                .map_or(true, |m| m.current().is_online()),
            realtime_state: realtime.as_ref().map(|h| h.watch_state()),
            realtime,
            _subscription: subscription,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(driver.run(commands_rx));
        info!("Sync engine started");

        SyncHandle {
            commands: commands_tx,
            status: status_rx,
            store: parts.store,
            queue: parts.queue,
            settings: parts.settings,
            cancel: cancel.clone(),
            driver: Arc::new(Mutex::new(Some(task))),
            _guard: Arc::new(ShutdownGuard(cancel)),
        }
    }
}

/// Cancels the engine once the last [`SyncHandle`] is dropped.
struct ShutdownGuard(CancellationToken);

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Cloneable control surface of a running engine. Dropping every clone
/// stops the engine as [`cleanup`](SyncHandle::cleanup) would, without
/// waiting for it.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SyncStatus>,
    store: Arc<dyn LocalStore>,
    queue: Arc<PendingQueue>,
    settings: SyncSettings,
    cancel: CancellationToken,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
    _guard: Arc<ShutdownGuard>,
}

impl SyncHandle {
    /// Runs a cycle now, or joins the one that is about to start.
    pub async fn sync_now(&self) -> CycleResult {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::SyncNow(tx))
            .map_err(|_| SyncError::ShutDown)?;
        rx.await.map_err(|_| SyncError::ShutDown)?
    }

    /// Like [`sync_now`](Self::sync_now), retrying transient transport
    /// failures with exponential backoff up to `max_retries` attempts.
    pub async fn retry_sync(&self) -> CycleResult {
        let mut attempt = 1;
        loop {
            match self.sync_now().await {
                Err(e) if e.is_transient() && attempt < self.settings.max_retries => {
                    let delay = self
                        .settings
                        .retry_base_delay
                        .saturating_mul(2u32.saturating_pow(attempt - 1));
                    warn!(attempt, error = %e, ?delay, "Sync failed, retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(SyncError::ShutDown),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Applies a local mutation to the store, queues it for upload and
    /// schedules a debounced cycle. Updates are stamped with the current
    /// time.
    pub fn record_local_change(
        &self,
        kind: ChangeKind,
        mut entity: SyncedEntity,
    ) -> Result<PendingChange, SyncError> {
        if kind == ChangeKind::Update {
            entity.touch(Utc::now());
        }
        let change = self.queue.enqueue(kind, entity.clone())?;
        match kind {
            ChangeKind::Delete => {
                self.store.delete(&entity.key())?;
            }
            ChangeKind::Create | ChangeKind::Update => self.store.put(entity)?,
        }
        let _ = self.commands.send(Command::LocalChange);
        Ok(change)
    }

    /// Schedules a cycle for a change announced outside the real-time
    /// channel, e.g. a push notification.
    pub fn notify_remote_change(&self) {
        let _ = self.commands.send(Command::RemoteChange);
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Receiver of every published status. Dropping it unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    pub fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    /// Stops the driver, its timers and the real-time channel. Callers
    /// waiting on an in-flight cycle get [`SyncError::ShutDown`].
    pub async fn cleanup(&self) {
        self.cancel.cancel();
        let task = self
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle")
            .field("status", &*self.status.borrow())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
