//! Common test infrastructure for capstan-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use capstan_core::error::Result;
use capstan_core::manager::ProcessManager;
use capstan_core::policy::{PolicyDocument, PolicySource};
use capstan_core::queue::{ProcessQueueManager, SqliteQueueStore};

/// A policy source that hands out one fixed document to everyone.
pub struct FixedPolicySource(pub PolicyDocument);

#[async_trait]
impl PolicySource for FixedPolicySource {
    async fn policy_for(
        &self,
        _organization_id: Option<Uuid>,
        _project_id: Option<Uuid>,
        _initiator: Option<&str>,
    ) -> Result<Option<PolicyDocument>> {
        Ok(Some(self.0.clone()))
    }
}

/// Test context over an in-memory SQLite store.
pub struct TestContext {
    pub store: Arc<SqliteQueueStore>,
    pub queue: ProcessQueueManager,
    pub manager: Arc<ProcessManager>,
}

impl TestContext {
    /// A context with no policies configured.
    pub async fn new() -> Self {
        Self::with_policy(None).await
    }

    /// A context enforcing the given policy document.
    pub async fn with_policy(policy: Option<PolicyDocument>) -> Self {
        let store = Arc::new(
            SqliteQueueStore::in_memory()
                .await
                .expect("failed to create in-memory store"),
        );

        let mut builder = ProcessManager::builder()
            .store(store.clone())
            .sync_poll_delay(Duration::from_millis(10));
        if let Some(doc) = policy {
            builder = builder.policy_source(Arc::new(FixedPolicySource(doc)));
        }

        let manager = builder.build().expect("failed to build manager");
        let queue = manager.queue().clone();

        Self {
            store,
            queue,
            manager,
        }
    }
}
