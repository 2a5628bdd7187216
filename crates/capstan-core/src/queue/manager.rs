//! High-level queue operations shared by processors and coordinators.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::payload::Payload;
use crate::process::{ProcessStatus, RepositoryInfo};

use super::{CountScope, QueueEntry, QueueEntryInsert, QueueStore, StatusHistoryEntry};

/// Statuses a process may be enqueued from.
const ENQUEUEABLE: [ProcessStatus; 3] = [
    ProcessStatus::New,
    ProcessStatus::Resuming,
    ProcessStatus::Suspended,
];

/// Wraps the queue store with logging and the state guards the pipelines
/// rely on.
#[derive(Clone)]
pub struct ProcessQueueManager {
    store: Arc<dyn QueueStore>,
}

impl ProcessQueueManager {
    /// Create a manager over the given store.
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Create the initial NEW row for the payload's process.
    ///
    /// Must be called exactly once per process key, before any expensive
    /// work, so crash recovery and auditing always have a row to inspect.
    pub async fn insert_initial(&self, payload: &Payload) -> Result<()> {
        let entry = QueueEntryInsert {
            key: payload.process_key,
            kind: payload.kind,
            parent_instance_id: payload.parent_instance_id,
            organization_id: payload.organization_id,
            project_id: payload.project_id,
            initiator: payload.initiator.clone(),
            tags: payload.tags.iter().cloned().collect(),
        };

        self.store.insert_initial(&entry).await?;
        debug!(instance_id = %payload.process_key, "queue entry created");
        Ok(())
    }

    /// Move the process to ENQUEUED.
    ///
    /// Only legal from NEW, RESUMING or SUSPENDED; the transition itself is
    /// a compare-and-swap from the observed status so a racing transition
    /// is rejected, not overwritten.
    pub async fn enqueue(&self, instance_id: Uuid) -> Result<()> {
        let current = self
            .store
            .get_status(instance_id)
            .await?
            .ok_or(OrchestratorError::ProcessNotFound { instance_id })?;

        if !ENQUEUEABLE.contains(&current) {
            return Err(OrchestratorError::InvalidProcessState {
                instance_id,
                expected: "NEW, RESUMING or SUSPENDED".to_string(),
                actual: current.as_str().to_string(),
            });
        }

        let updated = self
            .store
            .update_expected_status(instance_id, current, ProcessStatus::Enqueued)
            .await?;
        if !updated {
            return Err(OrchestratorError::InvalidProcessState {
                instance_id,
                expected: current.as_str().to_string(),
                actual: "(changed concurrently)".to_string(),
            });
        }

        info!(%instance_id, "process enqueued");
        Ok(())
    }

    /// Unconditional status transition, for terminal and administrative
    /// moves.
    pub async fn update_status(&self, instance_id: Uuid, status: ProcessStatus) -> Result<()> {
        self.store.update_status(instance_id, status).await
    }

    /// Compare-and-swap status transition.
    pub async fn update_expected_status(
        &self,
        instance_id: Uuid,
        expected: ProcessStatus,
        next: ProcessStatus,
    ) -> Result<bool> {
        self.store
            .update_expected_status(instance_id, expected, next)
            .await
    }

    /// Mark the process FAILED and record the error message.
    pub async fn mark_failed(&self, instance_id: Uuid, message: &str) -> Result<()> {
        self.store.record_error(instance_id, message).await?;
        self.store
            .update_status(instance_id, ProcessStatus::Failed)
            .await
    }

    /// Cancel a process.
    ///
    /// Terminal processes are left untouched (cancellation is idempotent).
    /// The transition is linearized through CAS so a concurrent resume or
    /// finish wins or loses atomically; a handful of retries absorbs the
    /// race.
    pub async fn cancel(&self, instance_id: Uuid) -> Result<()> {
        for _ in 0..3 {
            let current = self
                .store
                .get_status(instance_id)
                .await?
                .ok_or(OrchestratorError::ProcessNotFound { instance_id })?;

            if current.is_terminal() {
                debug!(%instance_id, status = %current, "cancel is a no-op, process is terminal");
                return Ok(());
            }

            if self
                .store
                .update_expected_status(instance_id, current, ProcessStatus::Cancelled)
                .await?
            {
                info!(%instance_id, "process cancelled");
                return Ok(());
            }

            warn!(%instance_id, "cancel lost a status race, retrying");
        }

        Err(OrchestratorError::InvalidProcessState {
            instance_id,
            expected: "any non-terminal".to_string(),
            actual: "(changing concurrently)".to_string(),
        })
    }

    /// Fetch an entry, failing when it does not exist.
    pub async fn expect_entry(&self, instance_id: Uuid) -> Result<QueueEntry> {
        self.store
            .get(instance_id)
            .await?
            .ok_or(OrchestratorError::ProcessNotFound { instance_id })
    }

    /// Fetch just the current status, failing when the process is unknown.
    pub async fn expect_status(&self, instance_id: Uuid) -> Result<ProcessStatus> {
        self.store
            .get_status(instance_id)
            .await?
            .ok_or(OrchestratorError::ProcessNotFound { instance_id })
    }

    /// Record repository provenance on an entry.
    pub async fn update_repository_info(
        &self,
        instance_id: Uuid,
        info: &RepositoryInfo,
    ) -> Result<()> {
        self.store.update_repository_info(instance_id, info).await
    }

    /// Ancestor depth of a process (0 for a root process).
    pub async fn ancestor_depth(&self, instance_id: Uuid) -> Result<i64> {
        self.store.ancestor_depth(instance_id).await
    }

    /// Count of entries in the given statuses at the given scope,
    /// optionally excluding one instance.
    pub async fn count_in_statuses(
        &self,
        scope: CountScope,
        statuses: &[ProcessStatus],
        excluding: Option<Uuid>,
    ) -> Result<i64> {
        self.store.count_in_statuses(scope, statuses, excluding).await
    }

    /// Per-status counts at the given scope, for metrics.
    pub async fn status_counts(&self, scope: CountScope) -> Result<BTreeMap<String, i64>> {
        self.store.status_counts(scope).await
    }

    /// Current statuses for a set of processes.
    pub async fn find_statuses(
        &self,
        instance_ids: &[Uuid],
    ) -> Result<BTreeMap<Uuid, Option<ProcessStatus>>> {
        self.store.find_statuses(instance_ids).await
    }

    /// Direct children of a process, oldest first.
    pub async fn children_of(&self, parent_instance_id: Uuid) -> Result<Vec<QueueEntry>> {
        self.store.children_of(parent_instance_id).await
    }

    /// Status transitions of a process, oldest first.
    pub async fn status_history(&self, instance_id: Uuid) -> Result<Vec<StatusHistoryEntry>> {
        self.store.status_history(instance_id).await
    }
}
