//! Typed transition events.
//!
//! The controller emits one event per state transition. Forwarding to
//! logs, alerts, or webhooks is the subscriber's responsibility; delivery
//! is best-effort and lagging receivers drop the oldest events.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use gantry_state::{DeploymentId, DeploymentStatus};

/// One deployment state transition.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentEvent {
    pub deployment_id: DeploymentId,
    pub route: String,
    pub from: DeploymentStatus,
    pub to: DeploymentStatus,
    pub stage_index: u32,
    pub at: u64,
    pub detail: String,
}

/// Broadcast fan-out for deployment events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DeploymentEvent>,
}

impl EventBus {
    /// An event bus buffering up to `capacity` events per receiver.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A send with no subscribers is not an error.
    pub fn publish(&self, event: DeploymentEvent) {
        if self.tx.send(event).is_err() {
            debug!("deployment event dropped: no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
