use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::limits::CHANGE_CHANNEL_CAPACITY;
use crate::model::Change;

/// Broadcast hub for store change-feeds, one channel per collection path.
pub struct ChangeHub {
    channels: DashMap<String, broadcast::Sender<Change>>,
}

impl Default for ChangeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to changes under `path`. Creates the channel if needed.
    pub fn subscribe(&self, path: &str) -> broadcast::Receiver<Change> {
        self.channels
            .entry(path.to_string())
            .or_insert_with(|| broadcast::channel(CHANGE_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a change. No-op if nobody is listening.
    pub fn send(&self, change: Change) {
        if let Some(sender) = self.channels.get(&change.path) {
            let _ = sender.send(change);
        }
    }

    pub fn receiver_count(&self, path: &str) -> usize {
        self.channels
            .get(path)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}
