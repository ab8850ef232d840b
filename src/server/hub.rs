//! Fan-out of real-time messages between a user's connections.

use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::transport::protocol::RealtimeMessage;

/// Who caused a message on a user's channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Server,
    /// A relay connection; the message is not echoed back to it.
    Connection(Uuid),
    /// A device's upload; none of that device's connections get it.
    Device(String),
}

/// A message on a user's channel, tagged with its origin so the relay can
/// skip echoing it back.
#[derive(Debug, Clone)]
pub struct HubMessage {
    pub origin: Origin,
    pub message: RealtimeMessage,
}

impl HubMessage {
    /// Whether a connection, opened by `device` if it said so, should
    /// forward this message to its client.
    pub fn is_for(&self, connection: Uuid, device: Option<&str>) -> bool {
        match &self.origin {
            Origin::Server => true,
            Origin::Connection(id) => *id != connection,
            Origin::Device(id) => device != Some(id.as_str()),
        }
    }
}

/// Tracks every connected client, one broadcast channel per user.
pub struct RealtimeHub {
    channels: RwLock<HashMap<String, broadcast::Sender<HubMessage>>>,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub async fn subscribe(&self, user_id: &str) -> broadcast::Receiver<HubMessage> {
        let mut channels = self.channels.write().await;

        if let Some(sender) = channels.get(user_id) {
            sender.subscribe()
        } else {
            let (sender, receiver) = broadcast::channel(16);
            channels.insert(user_id.to_string(), sender);
            receiver
        }
    }

    /// Sends to every subscriber of `user_id`. Returns how many received it.
    pub async fn broadcast(
        &self,
        user_id: &str,
        origin: Origin,
        message: RealtimeMessage,
    ) -> usize {
        let channels = self.channels.read().await;

        match channels.get(user_id) {
            // Send fails only when nobody is subscribed
            Some(sender) => sender.send(HubMessage { origin, message }).unwrap_or(0),
            None => 0,
        }
    }

    /// Drops channels with no remaining subscribers.
    pub async fn prune(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub async fn connection_count(&self, user_id: &str) -> usize {
        let channels = self.channels.read().await;
        channels.get(user_id).map_or(0, |s| s.receiver_count())
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}
