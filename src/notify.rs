use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, InspectorId};

const CHANNEL_CAPACITY: usize = 256;

/// Per-inspector change feed. A reschedule across inspectors is sent to both.
pub struct NotifyHub {
    channels: DashMap<InspectorId, broadcast::Sender<Event>>,
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

    /// Subscribe to an inspector's schedule changes. Creates the channel if needed.
    pub fn subscribe(&self, inspector_id: InspectorId) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(inspector_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, inspector_id: InspectorId, event: &Event) {
        if let Some(sender) = self.channels.get(&inspector_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels whose subscribers have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
