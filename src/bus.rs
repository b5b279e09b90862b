//! Job lifecycle notifications.
//!
//! Components publish through an injected [`EventBus`] rather than a global,
//! so tests can swap in their own bus and observe the lifecycle.

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobLifecycleEvent {
    JobCreated {
        job_id: String,
        targets: usize,
    },
    JobStreamStarted {
        job_id: String,
    },
    JobFinished {
        job_id: String,
        succeeded: usize,
        failed: usize,
    },
    JobDeleted {
        job_id: String,
    },
}

pub trait EventBus: Send + Sync + std::fmt::Debug {
    fn publish(&self, event: JobLifecycleEvent);
}

/// Fan-out to any number of in-process subscribers. Publishing with no
/// subscribers is a no-op; slow subscribers lag and lose events.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<JobLifecycleEvent>,
}

impl BroadcastBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobLifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for BroadcastBus {
    fn publish(&self, event: JobLifecycleEvent) {
        tracing::trace!(name: "bus.publish", ?event, "Lifecycle event");
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}
