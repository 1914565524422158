use tokio::sync::broadcast;

use crate::types::EngineEvent;

/// Progress feed shared by both engines and the summarizer.
///
/// Every subscriber sees each event the engines publish.
/// A subscriber that falls more than `capacity` events behind loses the
/// oldest ones (`RecvError::Lagged`); the engines never wait on readers.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Send `event` to current subscribers; a no-op when there are none.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
