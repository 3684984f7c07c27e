use {
    switchboard_common::types::{Device, Message},
    tokio::sync::broadcast,
};

/// Row-level change notification.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    MessageInserted(Message),
    DeviceInserted(Device),
}

/// Fan-out of [`StoreEvent`]s to every subscriber.
///
/// A subscriber that falls more than `capacity` events behind receives
/// `RecvError::Lagged` and must resynchronize from the store.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<StoreEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: StoreEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}
