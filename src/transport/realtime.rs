//! Real-time push channel over WebSocket.
//!
//! The channel is advisory: an inbound `sync_update` only tells the engine
//! to run a cycle, and outbound `sync_notify` messages are dropped when the
//! socket is down. Unexpected closes are retried with exponential backoff;
//! once the attempts are used up the channel settles in
//! [`RealtimeState::Degraded`] and the engine polls instead.

use std::fmt;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::PendingChange;
use crate::queue::ChangeNotifier;

use super::protocol::RealtimeMessage;

const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeConfig {
    pub url: String,
    pub api_key: Option<String>,
    /// Reconnection attempts after an unexpected close.
    pub max_attempts: u32,
    /// Delay before the first reconnection; doubles on each attempt.
    pub base_delay: Duration,
    pub connect_timeout: Duration,
    /// Identifies this engine so the server skips echoing its own uploads.
    pub device_id: Option<String>,
}

impl RealtimeConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            device_id: None,
        }
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    /// Delay before reconnection attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    fn url_for(&self, user_id: &str) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}userId={}",
            self.url,
            separator,
            urlencoding::encode(user_id)
        );
        if let Some(device) = &self.device_id {
            url.push_str("&deviceId=");
            url.push_str(&urlencoding::encode(device));
        }
        url
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnection attempts exhausted.
    Degraded,
    Closed,
}

impl RealtimeState {
    pub fn is_connected(&self) -> bool {
        matches!(self, RealtimeState::Connected)
    }
}

impl fmt::Display for RealtimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RealtimeState::Connecting => write!(f, "connecting"),
            RealtimeState::Connected => write!(f, "connected"),
            RealtimeState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
            RealtimeState::Degraded => write!(f, "degraded"),
            RealtimeState::Closed => write!(f, "closed"),
        }
    }
}

/// Owner side of a running channel.
pub struct RealtimeHandle {
    user_id: String,
    outbound: mpsc::Sender<RealtimeMessage>,
    state: watch::Receiver<RealtimeState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RealtimeHandle {
    pub fn state(&self) -> RealtimeState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RealtimeState> {
        self.state.clone()
    }

    /// Queues a message for the socket. Dropped when not connected.
    pub fn send(&self, message: RealtimeMessage) -> bool {
        if !self.state().is_connected() {
            return false;
        }
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Dropping real-time message");
                false
            }
        }
    }

    /// Stops the channel and waits for its task to finish.
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

impl ChangeNotifier for RealtimeHandle {
    fn notify(&self, change: &PendingChange) {
        self.send(RealtimeMessage::notify(change, &self.user_id));
    }
}

impl fmt::Debug for RealtimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeHandle")
            .field("user_id", &self.user_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Opens the channel for `user_id` in a background task. `on_update` runs
/// for every inbound `sync_update`.
pub fn connect<F>(
    config: RealtimeConfig,
    user_id: &str,
    on_update: F,
    cancel: CancellationToken,
) -> RealtimeHandle
where
    F: Fn(RealtimeMessage) + Send + Sync + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (state_tx, state_rx) = watch::channel(RealtimeState::Connecting);

    let channel = Channel {
        url: config.url_for(user_id),
        config,
        on_update: Box::new(on_update),
        outbound: outbound_rx,
        state: state_tx,
        cancel: cancel.clone(),
    };
    let task = tokio::spawn(channel.run());

    RealtimeHandle {
        user_id: user_id.to_string(),
        outbound: outbound_tx,
        state: state_rx,
        cancel,
        task,
    }
}

enum SessionEnd {
    Cancelled,
    Lost { was_connected: bool },
}

struct Channel {
    config: RealtimeConfig,
    url: String,
    on_update: Box<dyn Fn(RealtimeMessage) + Send + Sync>,
    outbound: mpsc::Receiver<RealtimeMessage>,
    state: watch::Sender<RealtimeState>,
    cancel: CancellationToken,
}

impl Channel {
    async fn run(mut self) {
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                self.set_state(RealtimeState::Reconnecting { attempt });
                let delay = self.config.backoff(attempt);
                debug!(attempt, ?delay, "Waiting before reconnecting");
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.session().await {
                SessionEnd::Cancelled => break,
                SessionEnd::Lost { was_connected } => {
                    if was_connected {
                        attempt = 0;
                    }
                    attempt += 1;
                    if attempt > self.config.max_attempts {
                        warn!(
                            attempts = self.config.max_attempts,
                            "Real-time channel unavailable, falling back to polling"
                        );
                        self.set_state(RealtimeState::Degraded);
                        return;
                    }
                }
            }
        }
        self.set_state(RealtimeState::Closed);
        debug!("Real-time channel closed");
    }

    async fn session(&mut self) -> SessionEnd {
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
            result = timeout(self.config.connect_timeout, connect_async(self.url.as_str())) => result,
        };
        let ws_stream = match connected {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                debug!(error = %e, "Real-time connect failed");
                return SessionEnd::Lost {
                    was_connected: false,
                };
            }
            Err(_) => {
                debug!("Real-time connect timed out");
                return SessionEnd::Lost {
                    was_connected: false,
                };
            }
        };
        let (mut sender, mut receiver) = ws_stream.split();

        if let Some(api_key) = &self.config.api_key {
            let auth = RealtimeMessage::Auth {
                api_key: api_key.clone(),
            };
            let sent = match auth.encode() {
                Ok(text) => sender.send(Message::Text(text.into())).await.is_ok(),
                Err(_) => false,
            };
            if !sent {
                return SessionEnd::Lost {
                    was_connected: false,
                };
            }
        }

        self.set_state(RealtimeState::Connected);
        info!("Real-time channel connected");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sender.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                Some(message) = self.outbound.recv() => {
                    let text = match message.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode real-time message");
                            continue;
                        }
                    };
                    if let Err(e) = sender.send(Message::Text(text.into())).await {
                        warn!(error = %e, "Real-time send failed");
                        return SessionEnd::Lost { was_connected: true };
                    }
                }
                incoming = receiver.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            return SessionEnd::Lost { was_connected: true };
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Real-time channel closed by server");
                        return SessionEnd::Lost { was_connected: true };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Real-time channel error");
                        return SessionEnd::Lost { was_connected: true };
                    }
                },
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match RealtimeMessage::decode(text) {
            Ok(message @ RealtimeMessage::SyncUpdate { .. }) => {
                debug!("Received sync_update");
                (self.on_update)(message);
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Ignoring malformed real-time message"),
        }
    }

    fn set_state(&self, state: RealtimeState) {
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeKind, Expense};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[test]
    fn test_backoff_doubles() {
        let config = RealtimeConfig::new("ws://h/ws");
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(5), Duration::from_secs(16));
    }

    #[test]
    fn test_url_carries_user_id() {
        assert_eq!(
            RealtimeConfig::new("ws://h/ws").url_for("u 1"),
            "ws://h/ws?userId=u%201"
        );
        assert_eq!(
            RealtimeConfig::new("ws://h/ws?v=2").url_for("u1"),
            "ws://h/ws?v=2&userId=u1"
        );
        assert_eq!(
            RealtimeConfig::new("ws://h/ws")
                .with_device_id("d1")
                .url_for("u1"),
            "ws://h/ws?userId=u1&deviceId=d1"
        );
    }

    #[tokio::test]
    async fn test_auth_update_and_notify_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
        let uri = Arc::new(Mutex::new(String::new()));
        let uri_sink = uri.clone();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                *uri_sink.lock().unwrap() = req.uri().to_string();
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();
            let mut first = true;
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    seen_tx.send(text.to_string()).unwrap();
                    if first {
                        first = false;
                        let update = r#"{"type":"sync_update"}"#;
                        ws.send(Message::Text(update.into())).await.unwrap();
                    }
                }
            }
        });

        let (update_tx, mut update_rx) = mpsc::unbounded_channel();
        let config = RealtimeConfig::new(format!("ws://{}/ws", addr))
            .with_api_key(Some("k1".to_string()));
        let handle = connect(
            config,
            "u1",
            move |msg| {
                let _ = update_tx.send(msg);
            },
            CancellationToken::new(),
        );

        let auth: serde_json::Value = serde_json::from_str(&seen_rx.recv().await.unwrap()).unwrap();
        assert_eq!(auth["type"], "auth");
        assert_eq!(auth["apiKey"], "k1");
        assert_eq!(*uri.lock().unwrap(), "/ws?userId=u1");

        let update = update_rx.recv().await.unwrap();
        assert!(matches!(update, RealtimeMessage::SyncUpdate { .. }));

        let mut state = handle.watch_state();
        state.wait_for(|s| s.is_connected()).await.unwrap();
        let change = PendingChange::new(
            ChangeKind::Create,
            Expense::new("g1", "Tea", 20.0, "m1").with_id("e1").into(),
        );
        handle.notify(&change);

        let notify: serde_json::Value =
            serde_json::from_str(&seen_rx.recv().await.unwrap()).unwrap();
        assert_eq!(notify["type"], "sync_notify");
        assert_eq!(notify["entity"]["id"], "e1");
        assert_eq!(notify["userId"], "u1");

        handle.close().await;
    }

    #[tokio::test]
    async fn test_unreachable_server_degrades_after_attempts() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = RealtimeConfig::new(format!("ws://{}/ws", addr));
        config.max_attempts = 2;
        config.base_delay = Duration::from_millis(10);
        let handle = connect(config, "u1", |_| {}, CancellationToken::new());

        let mut state = handle.watch_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == RealtimeState::Degraded),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(handle.state(), RealtimeState::Degraded);
        let change = PendingChange::new(
            ChangeKind::Create,
            Expense::new("g1", "Tea", 20.0, "m1").into(),
        );
        // Dropped silently while not connected.
        assert!(!handle.send(RealtimeMessage::notify(&change, "u1")));
    }

    #[tokio::test]
    async fn test_close_while_connecting_reports_closed() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = RealtimeConfig::new(format!("ws://{}/ws", addr));
        config.base_delay = Duration::from_secs(60);
        let handle = connect(config, "u1", |_| {}, CancellationToken::new());
        let mut state = handle.watch_state();
        state
            .wait_for(|s| matches!(s, RealtimeState::Reconnecting { .. }))
            .await
            .unwrap();

        handle.close().await;
        assert_eq!(*state.borrow(), RealtimeState::Closed);
    }
}
