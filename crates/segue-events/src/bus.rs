#![forbid(unsafe_code)]

use tokio::sync::broadcast;

use crate::StreamEvent;

/// Fan-out channel connecting the scheduler to its collaborators.
///
/// Every component holds a clone of the bus and publishes into one
/// broadcast channel; each subscriber sees the full event stream in
/// publish order and picks out the variants it cares about. Publishing
/// never waits: with no subscribers the event is dropped, and a
/// subscriber that falls behind the channel capacity observes
/// `RecvError::Lagged` instead of slowing the publisher down. That
/// policy is what lets the scheduler emit from inside a tick handler
/// without caring who is listening or how fast they drain.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<StreamEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per
    /// subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send an event to every current subscriber.
    ///
    /// Synchronous; callable from a tick handler or a blocking thread
    /// alike.
    pub fn publish(&self, event: StreamEvent) {
        let _ = self.tx.send(event);
    }

    /// Open an independent receiver for all events published from this
    /// point on. Earlier events are not replayed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
