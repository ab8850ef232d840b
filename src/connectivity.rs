//! Online/offline tracking with debounced, monotonic transition delivery.
//!
//! Inputs come from platform callbacks ([`ConnectivityMonitor::report`])
//! and from a periodic probe ([`ConnectivityMonitor::spawn_probe`]). Two
//! delivered transitions are always at least `min_interval` apart; a state
//! that flips back inside that window is never delivered.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lower bound for the spacing between two delivered transitions.
pub const MIN_TRANSITION_INTERVAL: Duration = Duration::from_secs(2);

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(&self) -> bool {
        matches!(self, Connectivity::Online)
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connectivity::Online => write!(f, "online"),
            Connectivity::Offline => write!(f, "offline"),
        }
    }
}

type Listener = Arc<dyn Fn(Connectivity) + Send + Sync>;

struct Inner {
    delivered: Connectivity,
    latest: Connectivity,
    last_transition: Option<Instant>,
    deferred: bool,
    listeners: Vec<(u64, Listener)>,
    next_id: u64,
}

#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Mutex<Inner>>,
    min_interval: Duration,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                delivered: initial,
                latest: initial,
                last_transition: None,
                deferred: false,
                listeners: Vec::new(),
                next_id: 0,
            })),
            min_interval: MIN_TRANSITION_INTERVAL,
        }
    }

    /// Sets the transition spacing. Values below two seconds are raised to it.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval.max(MIN_TRANSITION_INTERVAL);
        self
    }

    /// The last delivered state.
    pub fn current(&self) -> Connectivity {
        self.lock().delivered
    }

    /// Registers `listener`, which is called at once with the current state
    /// and then on every delivered transition until the subscription drops.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Connectivity) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let (id, current) = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.listeners.push((id, listener.clone()));
            (id, inner.delivered)
        };
        listener(current);

        Subscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Feeds an observed state into the monitor.
    pub fn report(&self, state: Connectivity) {
        let deliver_now = {
            let mut inner = self.lock();
            inner.latest = state;
            if state == inner.delivered {
                return;
            }
            let now = Instant::now();
            match inner.last_transition {
                Some(last) if now < last + self.min_interval => {
                    if !inner.deferred {
                        inner.deferred = self.defer(last + self.min_interval);
                    }
                    None
                }
                _ => Some(self.transition(&mut inner, now)),
            }
        };

        if let Some((state, listeners)) = deliver_now {
            deliver(state, &listeners);
        }
    }

    /// Periodically runs `probe` and reports the outcome until `cancel` fires.
    pub fn spawn_probe(
        &self,
        probe: Arc<dyn Probe>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            loop {
                let state = tokio::select! {
                    _ = cancel.cancelled() => break,
                    reachable = probe.check() => {
                        if reachable { Connectivity::Online } else { Connectivity::Offline }
                    }
                };
                monitor.report(state);

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("Connectivity probe stopped");
        })
    }

    fn transition(&self, inner: &mut Inner, now: Instant) -> (Connectivity, Vec<Listener>) {
        inner.delivered = inner.latest;
        inner.last_transition = Some(now);
        info!(state = %inner.delivered, "Connectivity changed");
        let listeners = inner.listeners.iter().map(|(_, l)| l.clone()).collect();
        (inner.delivered, listeners)
    }

    /// Re-evaluates the latest state once the transition window closes.
    /// Called with the lock held; returns whether a re-check was scheduled.
    fn defer(&self, at: Instant) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to defer connectivity transition; waiting for next report");
            return false;
        };
        let monitor = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep_until(at).await;
            let deliver_now = {
                let mut inner = monitor.lock();
                inner.deferred = false;
                if inner.latest == inner.delivered {
                    None
                } else {
                    Some(monitor.transition(&mut inner, Instant::now()))
                }
            };
            if let Some((state, listeners)) = deliver_now {
                deliver(state, &listeners);
            }
        });
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn deliver(state: Connectivity, listeners: &[Listener]) {
    for listener in listeners {
        listener(state);
    }
}

impl fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("current", &self.current())
            .field("min_interval", &self.min_interval)
            .finish()
    }
}

/// Handle returned by [`ConnectivityMonitor::subscribe`]; the listener is
/// removed when this is dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    inner: Weak<Mutex<Inner>>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

/// A lightweight reachability check.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Probes `GET {endpoint}/health`.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/health", endpoint.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> bool {
        match self.client.get(&self.url).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, url = %self.url, "Health probe failed");
                false
            }
        }
    }
}
