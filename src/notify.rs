use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// A change notification for one lot. The payload is the event
/// serialized to JSON, ready to hand to a wire-level NOTIFY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub lot: String,
    pub payload: String,
}

/// Broadcast hub for per-lot change notifications.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Notice>>,
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
        }
    }

    /// Subscribe to notifications for a lot. Creates the channel if needed.
    pub fn subscribe(&self, lot: &str) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(lot.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, lot: &str, event: &Event) {
        if let Some(sender) = self.channels.get(lot) {
            let payload = match serde_json::to_string(event) {
                Ok(p) => p,
                Err(_) => return,
            };
            let _ = sender.send(Notice {
                lot: lot.to_string(),
                payload,
            });
        }
    }

    /// Remove a channel (e.g. when nobody should listen anymore).
    #[allow(dead_code)]
    pub fn remove(&self, lot: &str) {
        self.channels.remove(lot);
    }
}
