//! In-process pub/sub for deliberation events.
//!
//! Built on a Tokio broadcast channel with a bounded buffer. Publishing
//! never blocks: a subscriber that falls more than the buffer behind loses
//! the oldest events and is told how many it missed.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::CouncilEvent;

/// Bounded per-subscriber buffer.
pub const CHANNEL_CAPACITY: usize = 64;

/// Errors surfaced to subscribers.
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    /// The subscriber fell behind and `missed` events were dropped for it.
    #[error("subscriber lagged, {missed} events dropped")]
    SubscriberLagged { missed: u64 },

    /// The bus was dropped while the subscriber was waiting.
    #[error("event channel closed")]
    Closed,
}

/// Shared handle to the event bus.
pub type SharedEventBus = Arc<EventBus>;

/// Broadcast-backed event bus.
pub struct EventBus {
    sender: broadcast::Sender<CouncilEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers. Having no subscribers is fine.
    pub fn publish(&self, event: CouncilEvent) {
        let kind = event.kind();
        match self.sender.send(event) {
            Ok(receivers) => debug!(kind, receivers, "event published"),
            Err(_) => debug!(kind, "event published (no receivers)"),
        }
    }

    /// Subscribe to every event on the bus.
    pub fn subscribe(&self) -> broadcast::Receiver<CouncilEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events of a single request.
    pub fn subscribe_request(&self, request_id: &str) -> RequestReceiver {
        RequestReceiver {
            receiver: self.sender.subscribe(),
            request_id: request_id.to_string(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver yielding only one request's events, in emission order.
pub struct RequestReceiver {
    receiver: broadcast::Receiver<CouncilEvent>,
    request_id: String,
}

impl RequestReceiver {
    /// Receive the next event for this request.
    ///
    /// A lag is reported once and reception continues from the oldest
    /// retained event.
    pub async fn recv(&mut self) -> Result<CouncilEvent, EventBusError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.request_id() == self.request_id => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(
                        request_id = %self.request_id,
                        missed, "event subscriber lagged"
                    );
                    return Err(EventBusError::SubscriberLagged { missed });
                }
                Err(broadcast::error::RecvError::Closed) => return Err(EventBusError::Closed),
            }
        }
    }
}
