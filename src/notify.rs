use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Event, Ms};

const CHANNEL_CAPACITY: usize = 256;
const FEED_CAPACITY: usize = 4096;

/// A committed change, as seen by audit-log, calendar and QR consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub node_id: Ulid,
    pub event: Event,
    pub committed_at: Ms,
    /// JSON rendering of `event`.
    pub payload: String,
}

#[derive(Serialize)]
struct Envelope<'a> {
    kind: &'static str,
    node_id: Ulid,
    committed_at: Ms,
    event: &'a Event,
}

/// Broadcast hub: one channel per node plus a global feed.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Arc<Notification>>>,
    feed: broadcast::Sender<Arc<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            feed: broadcast::channel(FEED_CAPACITY).0,
        }
    }

    /// Subscribe to changes of one node. Creates the channel if needed.
    pub fn subscribe(&self, node_id: Ulid) -> broadcast::Receiver<Arc<Notification>> {
        self.channels
            .entry(node_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Subscribe to every committed event.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Arc<Notification>> {
        self.feed.subscribe()
    }

    /// Publish a committed event. No-op when nobody is listening.
    pub fn send(&self, event: &Event, committed_at: Ms) {
        let node_id = event.node_id();
        let listening = self.feed.receiver_count() > 0 || self.channels.contains_key(&node_id);
        if !listening {
            return;
        }
        let envelope = Envelope {
            kind: event.label(),
            node_id,
            committed_at,
            event,
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(%node_id, "change feed payload encoding failed: {e}");
                return;
            }
        };
        let notification = Arc::new(Notification {
            node_id,
            event: event.clone(),
            committed_at,
            payload,
        });
        if let Some(sender) = self.channels.get(&node_id) {
            let _ = sender.send(notification.clone());
        }
        let _ = self.feed.send(notification);
    }

    /// Drop the channel of a deleted node.
    pub fn remove(&self, node_id: &Ulid) {
        self.channels.remove(node_id);
    }
}
