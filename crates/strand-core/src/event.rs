use tokio::sync::broadcast;

use crate::context::ExecutionId;

/// Execution lifecycle event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Execution admitted and started.
    Started {
        execution_id: ExecutionId,
        workflow_id: String,
    },
    /// Execution finished successfully.
    Completed {
        execution_id: ExecutionId,
        workflow_id: String,
    },
    /// Execution failed.
    Failed {
        execution_id: ExecutionId,
        workflow_id: String,
        error: String,
    },
    /// Orchestrator shut down.
    Shutdown,
}

/// Fan-out channel for execution lifecycle events. Every subscriber gets
/// its own receiver and sees every event published after it subscribed; a
/// receiver that falls more than `capacity` events behind starts missing
/// the oldest ones.
pub struct EventBus {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to whoever is listening. With no subscribers the event is
    /// simply dropped.
    pub fn publish(&self, event: ExecutionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
