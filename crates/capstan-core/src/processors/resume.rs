//! Resume-pipeline processors: merge resume data and dispatch to the
//! external runner.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::error::{OrchestratorError, Result};
use crate::external::{Dispatcher, ExecutionUnit};
use crate::payload::Payload;
use crate::pipeline::{Chain, Processor};
use crate::process::ProcessStatus;
use crate::queue::ProcessQueueManager;

use super::WORKSPACE_HEADER;

/// Configuration key carrying the resume event to the runner.
const RESUME_EVENT_KEY: &str = "resumeEvent";

/// Records the resume event in the configuration handed to the runner.
pub struct ResumeDataProcessor;

#[async_trait]
impl Processor for ResumeDataProcessor {
    async fn process(&self, chain: Chain, payload: Payload) -> Result<Payload> {
        let Some(event) = payload.resume_event.clone() else {
            return chain.process(payload).await;
        };

        let mut configuration = payload.configuration.clone();
        configuration.insert(RESUME_EVENT_KEY.to_string(), json!(event));

        chain.process(payload.with_configuration(configuration)).await
    }
}

/// Hands the resolved unit to the external runner and completes the
/// two-step resume transition (`RESUMING -> RUNNING`).
///
/// The first resume signal's CAS flipped `SUSPENDED -> RESUMING`; this
/// final CAS rejects anything that slipped past it.
pub struct DispatchProcessor {
    dispatcher: Arc<dyn Dispatcher>,
    queue: ProcessQueueManager,
}

impl DispatchProcessor {
    /// Create the processor.
    pub fn new(dispatcher: Arc<dyn Dispatcher>, queue: ProcessQueueManager) -> Self {
        Self { dispatcher, queue }
    }
}

#[async_trait]
impl Processor for DispatchProcessor {
    async fn process(&self, chain: Chain, payload: Payload) -> Result<Payload> {
        let unit = ExecutionUnit {
            process_key: payload.process_key,
            workspace: payload
                .header(WORKSPACE_HEADER)
                .and_then(|v| v.as_str())
                .map(PathBuf::from),
            configuration: payload.configuration.clone(),
            entry_point: payload.entry_point.clone(),
        };

        self.dispatcher.dispatch(unit).await?;

        let instance_id = payload.process_key.instance_id;
        let updated = self
            .queue
            .update_expected_status(instance_id, ProcessStatus::Resuming, ProcessStatus::Running)
            .await?;
        if !updated {
            let actual = self.queue.expect_status(instance_id).await?;
            return Err(OrchestratorError::InvalidProcessState {
                instance_id,
                expected: ProcessStatus::Resuming.as_str().to_string(),
                actual: actual.as_str().to_string(),
            });
        }

        chain.process(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::NoopDispatcher;
    use crate::pipeline::{NoopFaultHandler, Pipeline};
    use crate::process::ProcessKey;
    use crate::queue::SqliteQueueStore;

    async fn queue() -> ProcessQueueManager {
        ProcessQueueManager::new(Arc::new(SqliteQueueStore::in_memory().await.unwrap()))
    }

    #[tokio::test]
    async fn resume_event_recorded_in_configuration() {
        let pipeline = Pipeline::new(
            "test",
            vec![Arc::new(ResumeDataProcessor)],
            Arc::new(NoopFaultHandler),
        );

        let mut payload = Payload::new(ProcessKey::generate());
        payload.resume_event = Some("ev-42".to_string());

        let out = pipeline.process(payload).await.unwrap();
        assert_eq!(out.configuration.get(RESUME_EVENT_KEY), Some(&json!("ev-42")));
    }

    #[tokio::test]
    async fn dispatch_completes_two_step_resume() {
        let q = queue().await;
        let pipeline = Pipeline::new(
            "test",
            vec![Arc::new(DispatchProcessor::new(
                Arc::new(NoopDispatcher),
                q.clone(),
            ))],
            Arc::new(NoopFaultHandler),
        );

        let payload = Payload::new(ProcessKey::generate());
        let instance_id = payload.process_key.instance_id;
        q.insert_initial(&payload).await.unwrap();
        q.update_status(instance_id, ProcessStatus::Resuming)
            .await
            .unwrap();

        pipeline.process(payload).await.unwrap();
        assert_eq!(
            q.expect_status(instance_id).await.unwrap(),
            ProcessStatus::Running
        );
    }

    #[tokio::test]
    async fn dispatch_rejects_wrong_state() {
        let q = queue().await;
        let pipeline = Pipeline::new(
            "test",
            vec![Arc::new(DispatchProcessor::new(
                Arc::new(NoopDispatcher),
                q.clone(),
            ))],
            Arc::new(NoopFaultHandler),
        );

        let payload = Payload::new(ProcessKey::generate());
        q.insert_initial(&payload).await.unwrap();

        let err = pipeline.process(payload).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_PROCESS_STATE");
    }
}
