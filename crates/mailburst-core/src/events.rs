//! Progress event bus

use mailburst_common::types::ProgressEvent;
use tokio::sync::broadcast;
use tracing::debug;

/// Broadcast channel carrying per-attempt, per-batch, and per-job events.
///
/// The core never persists events; downstream observers (UI, audit trail)
/// subscribe and do their own persistence. Emitting with no live
/// subscribers is not an error.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe a new observer. Slow observers may lag and miss events;
    /// the engine never blocks on them.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ProgressEvent) {
        debug!("job {}: {:?}", event.job_id, event.event);
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
