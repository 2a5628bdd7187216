//! Kill-pipeline processor.

use async_trait::async_trait;

use crate::error::Result;
use crate::payload::Payload;
use crate::pipeline::{Chain, Processor};
use crate::queue::ProcessQueueManager;

/// Cancels the payload's process. Terminal processes are a no-op, so
/// repeated kill requests are idempotent.
pub struct CancelProcessor {
    queue: ProcessQueueManager,
}

impl CancelProcessor {
    /// Create the processor.
    pub fn new(queue: ProcessQueueManager) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Processor for CancelProcessor {
    async fn process(&self, chain: Chain, payload: Payload) -> Result<Payload> {
        self.queue.cancel(payload.process_key.instance_id).await?;
        chain.process(payload).await
    }
}
