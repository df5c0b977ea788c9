use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// An applied change, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub inspector_id: Ulid,
    pub event: Event,
    /// The event as JSON, the shape a presentation layer consumes.
    pub payload: String,
}

/// Broadcast hub: one channel per inspector.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to an inspector's changes. Creates the channel if needed.
    pub fn subscribe(&self, inspector_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(inspector_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, inspector_id: Ulid, event: &Event) {
        let Some(sender) = self.channels.get(&inspector_id) else {
            return;
        };
        if sender.receiver_count() == 0 {
            return;
        }
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("notify payload for {inspector_id}: {e}");
                return;
            }
        };
        let _ = sender.send(Notification {
            inspector_id,
            event: event.clone(),
            payload,
        });
    }

    /// Remove a channel (e.g. when the inspector is deleted).
    pub fn remove(&self, inspector_id: &Ulid) {
        self.channels.remove(inspector_id);
    }
}
