//! Exclusive-group mutual exclusion.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::Result;
use crate::payload::Payload;
use crate::pipeline::{Chain, Processor};
use crate::queue::{ProcessQueueManager, QueueStore as _};

/// Ensures at most one runnable process per `(project, exclusive group)`.
///
/// Opt-in: a payload without an exclusive group or a project always
/// continues. The existence-check-and-decide is atomic against concurrent
/// submissions of the same group; the store holds its serializing lock
/// only for the duration of the check, never across the rest of the
/// pipeline. The loser is cancelled inside the same transaction and the
/// chain stops cleanly, not as a fault.
pub struct ExclusiveGroupProcessor {
    queue: ProcessQueueManager,
}

impl ExclusiveGroupProcessor {
    /// Create the processor.
    pub fn new(queue: ProcessQueueManager) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Processor for ExclusiveGroupProcessor {
    async fn process(&self, chain: Chain, payload: Payload) -> Result<Payload> {
        let (Some(group), Some(project_id)) = (&payload.exclusive_group, payload.project_id)
        else {
            return chain.process(payload).await;
        };

        info!(
            instance_id = %payload.process_key,
            exclusive_group = %group,
            "process' exclusive group"
        );

        let claimed = self
            .queue
            .store()
            .exclusive_claim(payload.process_key.instance_id, project_id, group)
            .await?;

        if !claimed {
            warn!(
                instance_id = %payload.process_key,
                exclusive_group = %group,
                "process(es) with this exclusive group already in the queue, current process has been cancelled"
            );
            return Ok(payload);
        }

        chain.process(payload).await
    }
}
