//! Fan-out of reconciled changes.
//!
//! The snapshot store publishes one [`AppliedChange`] per reconciled event,
//! in the order the events were applied. WebSocket connections and the
//! session manager each hold their own receiver.

use tokio::sync::broadcast;

use super::AppliedChange;

/// Broadcast bus for [`AppliedChange`]s.
///
/// A receiver that falls more than `capacity` notifications behind loses
/// the oldest ones and sees `RecvError::Lagged`; the snapshot is never
/// affected, so a lagging consumer can re-read it instead.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AppliedChange>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` notifications per receiver
    /// (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes `change`, returning how many receivers will see it.
    /// Nothing is buffered while nobody listens.
    pub fn publish(&self, change: AppliedChange) -> usize {
        self.sender.send(change).unwrap_or(0)
    }

    /// A receiver for changes published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AppliedChange> {
        self.sender.subscribe()
    }

    /// Live receivers, WebSocket clients included.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
