//! Queue entry lifecycle processors: the initial NEW row, the final
//! ENQUEUED transition, and the pipeline fault handler.

use async_trait::async_trait;
use tracing::warn;

use crate::error::{OrchestratorError, Result};
use crate::payload::Payload;
use crate::pipeline::{Chain, FaultHandler, Processor};
use crate::queue::ProcessQueueManager;

/// Creates the NEW queue row before any expensive work, so crash recovery
/// and auditing always have a row to inspect.
pub struct InitialQueueEntryProcessor {
    queue: ProcessQueueManager,
}

impl InitialQueueEntryProcessor {
    /// Create the processor.
    pub fn new(queue: ProcessQueueManager) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Processor for InitialQueueEntryProcessor {
    async fn process(&self, chain: Chain, payload: Payload) -> Result<Payload> {
        self.queue.insert_initial(&payload).await?;
        chain.process(payload).await
    }
}

/// Commits the ENQUEUED transition once the payload is fully resolved and
/// durably staged.
pub struct EnqueueProcessor {
    queue: ProcessQueueManager,
}

impl EnqueueProcessor {
    /// Create the processor.
    pub fn new(queue: ProcessQueueManager) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Processor for EnqueueProcessor {
    async fn process(&self, chain: Chain, payload: Payload) -> Result<Payload> {
        self.queue.enqueue(payload.process_key.instance_id).await?;
        chain.process(payload).await
    }
}

/// The pipelines' structured cleanup: transactionally marks the queue
/// entry FAILED and records the fault before it is rethrown.
pub struct QueueFailureHandler {
    queue: ProcessQueueManager,
}

impl QueueFailureHandler {
    /// Create the handler.
    pub fn new(queue: ProcessQueueManager) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl FaultHandler for QueueFailureHandler {
    async fn on_fault(&self, payload: &Payload, error: &OrchestratorError) {
        let instance_id = payload.process_key.instance_id;

        // A duplicate initial insert means the row belongs to an earlier,
        // still-valid submission; leave it alone.
        if matches!(error, OrchestratorError::AlreadyExists { .. }) {
            return;
        }

        if let Err(e) = self.queue.mark_failed(instance_id, &error.to_string()).await {
            // The fault may have happened before the row existed.
            warn!(%instance_id, error = %e, "failed to mark faulted process as FAILED");
        }
    }
}
