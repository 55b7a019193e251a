use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::SeatUpdate;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for LISTEN/NOTIFY, one channel per showtime topic
/// (`seats/{room}/{schedule}`).
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<SeatUpdate>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a topic. Creates the channel if needed.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<SeatUpdate> {
        let sender = self
            .channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a seat update. No-op if nobody is listening.
    pub fn send(&self, topic: &str, update: &SeatUpdate) {
        if let Some(sender) = self.channels.get(topic) {
            let _ = sender.send(update.clone());
        }
    }

    /// Remove a channel once its showtime is gone.
    #[allow(dead_code)]
    pub fn remove(&self, topic: &str) {
        self.channels.remove(topic);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}
