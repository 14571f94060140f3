//! Deliberation lifecycle events.
//!
//! Every stage boundary publishes an event on the in-process bus; SSE and
//! webhook collaborators subscribe and forward. Events within one request
//! are totally ordered; no ordering is promised across requests.

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventBusError, RequestReceiver, SharedEventBus, CHANNEL_CAPACITY};
pub use types::CouncilEvent;
