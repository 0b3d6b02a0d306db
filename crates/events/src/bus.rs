//! Event bus abstraction for decoupled event emission.
//!
//! The provisioning worker emits through a trait object, so the core logic
//! can be tested without a terminal attached and the front-end can choose
//! how events reach its own task.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::ProvisioningEvent;

/// Trait for emitting provisioning events to subscribers.
///
/// Implementations must be cheap and non-blocking: `emit` is called from the
/// background worker between chunk reads.
pub trait EventBus: Send + Sync {
    /// Emit a single event.
    fn emit(&self, event: ProvisioningEvent);
}

/// Type alias for shared event bus reference.
pub type EventBusRef = Arc<dyn EventBus>;

/// In-memory event bus for testing.
///
/// Captures all emitted events for later inspection.
#[derive(Default)]
pub struct InMemoryEventBus {
    events: Mutex<Vec<ProvisioningEvent>>,
}

impl InMemoryEventBus {
    /// Create a new in-memory event bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all captured events, in emission order.
    pub fn events(&self) -> Vec<ProvisioningEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Get the captured events matching a predicate.
    pub fn events_matching(
        &self,
        predicate: impl Fn(&ProvisioningEvent) -> bool,
    ) -> Vec<ProvisioningEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    /// Clear all captured events.
    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Get the number of captured events.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Check if no events have been captured.
    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }
}

impl EventBus for InMemoryEventBus {
    fn emit(&self, event: ProvisioningEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// No-op event bus that discards all events.
///
/// Useful when a caller runs the workflow purely for its result.
pub struct NullEventBus;

impl EventBus for NullEventBus {
    fn emit(&self, _event: ProvisioningEvent) {
        // Intentionally empty
    }
}

/// Event bus that forwards into an unbounded channel.
///
/// The front-end drains the receiver on its own task, which keeps every
/// terminal write off the provisioning worker.
pub struct ChannelEventBus {
    tx: mpsc::UnboundedSender<ProvisioningEvent>,
}

impl ChannelEventBus {
    /// Create a bus plus the receiver the consumer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProvisioningEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventBus for ChannelEventBus {
    fn emit(&self, event: ProvisioningEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("event channel closed, dropping event");
        }
    }
}
