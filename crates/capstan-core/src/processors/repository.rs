//! Repository resolution: stages a filesystem snapshot and records
//! provenance on the queue entry.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::error::Result;
use crate::external::{RepositoryRequest, RepositoryResolver};
use crate::payload::Payload;
use crate::pipeline::{Chain, Processor};
use crate::queue::ProcessQueueManager;

use super::{REPO_REF_HEADER, REPO_URL_HEADER, WORKSPACE_HEADER};

/// Fetches the process' repository snapshot, when one is referenced.
///
/// Skips when the payload names neither a registered repository nor an
/// explicit URL. The resolver serializes concurrent fetches of the same
/// repository internally.
pub struct RepositoryProcessor {
    resolver: Arc<dyn RepositoryResolver>,
    queue: ProcessQueueManager,
}

impl RepositoryProcessor {
    /// Create the processor.
    pub fn new(resolver: Arc<dyn RepositoryResolver>, queue: ProcessQueueManager) -> Self {
        Self { resolver, queue }
    }
}

#[async_trait]
impl Processor for RepositoryProcessor {
    async fn process(&self, chain: Chain, payload: Payload) -> Result<Payload> {
        let url = payload
            .header(REPO_URL_HEADER)
            .and_then(|v| v.as_str())
            .map(str::to_string);

        if payload.repository_id.is_none() && url.is_none() {
            return chain.process(payload).await;
        }

        let request = RepositoryRequest {
            project_id: payload.project_id,
            repository_id: payload.repository_id,
            url,
            reference: payload
                .header(REPO_REF_HEADER)
                .and_then(|v| v.as_str())
                .map(str::to_string),
        };

        let snapshot = self.resolver.fetch(&request).await?;
        debug!(
            instance_id = %payload.process_key,
            path = %snapshot.path.display(),
            "repository snapshot staged"
        );

        self.queue
            .update_repository_info(payload.process_key.instance_id, &snapshot.info)
            .await?;

        let payload = payload
            .with_repository(snapshot.info)
            .with_header(WORKSPACE_HEADER, json!(snapshot.path.to_string_lossy()));

        chain.process(payload).await
    }
}
