// Copyright (C) 2026 Capstan Contributors
// SPDX-License-Identifier: Apache-2.0
//! Suspend/resume-by-event.
//!
//! A waiting process persists a [`ProcessCompletionCondition`] and
//! transitions `RUNNING -> SUSPENDED`, releasing its execution slot. A
//! poll-driven watcher re-evaluates open conditions; when every awaited
//! child is terminal the condition is consumed exactly once and the
//! process resumes through the two-step CAS `SUSPENDED -> RESUMING ->
//! RUNNING`, so a duplicate resume signal cannot double-fire.
//!
//! No child-side push is required, which keeps the protocol robust to the
//! waiter being offline while children run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ChildFailure, OrchestratorError, Result};
use crate::process::ProcessStatus;
use crate::queue::{ProcessQueueManager, QueueStore as _};

/// Wait-condition type tag for "wait for processes to finish".
pub const PROCESS_COMPLETION: &str = "PROCESS_COMPLETION";

/// Persisted form of a "wait for children" condition.
///
/// Wire shape: `{type, reason, processes, resumeEvent, ...}`. Created when
/// a process suspends, consumed (and deleted) exactly once when satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessCompletionCondition {
    /// Condition type; always [`PROCESS_COMPLETION`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable reason for the wait.
    #[serde(default)]
    pub reason: Option<String>,
    /// The awaited child processes.
    pub processes: Vec<Uuid>,
    /// The event name the process resumes on.
    pub resume_event: String,
    /// Restart the exact pipeline step that requested the wait.
    #[serde(default)]
    pub resume_from_same_step: bool,
    /// Collect the children's output variables into the resume result.
    #[serde(default)]
    pub collect_out_vars: bool,
    /// Downgrade child failures from fault to warning.
    #[serde(default)]
    pub ignore_failures: bool,
}

impl ProcessCompletionCondition {
    /// A condition awaiting the given processes, with a freshly generated
    /// resume event name.
    pub fn awaiting(processes: Vec<Uuid>, reason: impl Into<String>) -> Self {
        Self {
            kind: PROCESS_COMPLETION.to_string(),
            reason: Some(reason.into()),
            processes,
            resume_event: Uuid::new_v4().to_string(),
            resume_from_same_step: false,
            collect_out_vars: false,
            ignore_failures: false,
        }
    }
}

/// A child's terminal outcome, reported to the resumed parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildOutcome {
    /// The child instance id.
    pub instance_id: Uuid,
    /// The child's terminal status.
    pub status: ProcessStatus,
    /// The child's recorded error, if any.
    pub error: Option<String>,
}

impl ChildOutcome {
    /// Whether the child finished successfully.
    pub fn is_success(&self) -> bool {
        self.status == ProcessStatus::Finished
    }
}

/// Resumes a process once its wait condition is satisfied.
///
/// Implemented by the process manager; the watcher depends only on this
/// boundary.
#[async_trait]
pub trait ProcessResumer: Send + Sync {
    /// Resume the process; its status is already RESUMING.
    async fn resume(
        &self,
        instance_id: Uuid,
        condition: &ProcessCompletionCondition,
        outcomes: &[ChildOutcome],
    ) -> Result<()>;
}

/// Persists wait conditions and performs the suspend transition.
#[derive(Clone)]
pub struct ProcessWaitService {
    queue: ProcessQueueManager,
}

impl ProcessWaitService {
    /// Create the service.
    pub fn new(queue: ProcessQueueManager) -> Self {
        Self { queue }
    }

    /// Suspend a running process on the given condition.
    ///
    /// The condition is persisted first, then the status flips
    /// `RUNNING -> SUSPENDED`; on a lost race the condition is removed
    /// again and the call fails. Returns the resume event name.
    pub async fn suspend(
        &self,
        instance_id: Uuid,
        condition: &ProcessCompletionCondition,
    ) -> Result<String> {
        self.queue
            .store()
            .set_wait_condition(instance_id, &serde_json::to_value(condition)?)
            .await?;

        let suspended = self
            .queue
            .update_expected_status(instance_id, ProcessStatus::Running, ProcessStatus::Suspended)
            .await?;

        if !suspended {
            let _ = self.queue.store().take_wait_condition(instance_id).await;
            let actual = self.queue.expect_status(instance_id).await?;
            return Err(OrchestratorError::InvalidProcessState {
                instance_id,
                expected: ProcessStatus::Running.as_str().to_string(),
                actual: actual.as_str().to_string(),
            });
        }

        info!(
            %instance_id,
            resume_event = %condition.resume_event,
            awaiting = condition.processes.len(),
            "process suspended"
        );
        Ok(condition.resume_event.clone())
    }
}

/// Poll-driven watcher for open wait conditions.
///
/// One background task re-evaluates every open condition on a cancellable
/// interval. Status reads are retried a fixed number of times with a
/// fixed delay on transient store errors before surfacing.
pub struct ProcessWaitWatcher {
    queue: ProcessQueueManager,
    resumer: Arc<dyn ProcessResumer>,
    poll_interval: Duration,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl ProcessWaitWatcher {
    /// Create a watcher with the given polling and retry settings.
    pub fn new(
        queue: ProcessQueueManager,
        resumer: Arc<dyn ProcessResumer>,
        poll_interval: Duration,
        retry_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            queue,
            resumer,
            poll_interval,
            retry_attempts,
            retry_delay,
        }
    }

    /// Spawn the watcher loop; it stops when the shutdown channel flips.
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("wait watcher received shutdown signal");
                            break;
                        }
                    }

                    _ = ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            warn!(error = %e, "wait watcher tick failed");
                        }
                    }
                }
            }

            info!("wait watcher stopped");
        })
    }

    /// Evaluate every open wait condition once.
    pub async fn tick(&self) -> Result<()> {
        for (instance_id, raw) in self.queue.store().list_wait_conditions().await? {
            let condition: ProcessCompletionCondition = match serde_json::from_value(raw) {
                Ok(c) => c,
                Err(e) => {
                    warn!(%instance_id, error = %e, "skipping malformed wait condition");
                    continue;
                }
            };

            if condition.kind != PROCESS_COMPLETION {
                debug!(%instance_id, kind = %condition.kind, "unsupported wait type");
                continue;
            }

            if let Err(e) = self.evaluate(instance_id, condition).await {
                warn!(%instance_id, error = %e, "wait condition evaluation failed");
            }
        }
        Ok(())
    }

    async fn evaluate(
        &self,
        instance_id: Uuid,
        condition: ProcessCompletionCondition,
    ) -> Result<()> {
        let statuses = self.find_statuses_with_retry(&condition.processes).await?;

        // A vanished child row counts as terminal; there is nothing left
        // to wait for.
        let all_terminal = condition.processes.iter().all(|id| {
            statuses
                .get(id)
                .map(|s| s.map(ProcessStatus::is_terminal).unwrap_or(true))
                .unwrap_or(true)
        });
        if !all_terminal {
            return Ok(());
        }

        // Consume exactly once; a concurrent evaluation sees None and backs
        // off.
        if self
            .queue
            .store()
            .take_wait_condition(instance_id)
            .await?
            .is_none()
        {
            return Ok(());
        }

        let mut outcomes = Vec::with_capacity(condition.processes.len());
        let mut failures = Vec::new();
        for id in &condition.processes {
            let outcome = match self.queue.store().get(*id).await? {
                Some(entry) => ChildOutcome {
                    instance_id: *id,
                    status: entry.status,
                    error: entry.error,
                },
                None => ChildOutcome {
                    instance_id: *id,
                    status: ProcessStatus::Cancelled,
                    error: Some("process not found".to_string()),
                },
            };

            if !outcome.is_success() {
                failures.push(ChildFailure {
                    instance_id: *id,
                    status: outcome.status.as_str().to_string(),
                    error: outcome.error.clone(),
                });
            }
            outcomes.push(outcome);
        }

        if !failures.is_empty() && !condition.ignore_failures {
            let err = OrchestratorError::ChildFailures { failures };
            // The losing side of this CAS already resumed or cancelled.
            if self
                .queue
                .update_expected_status(
                    instance_id,
                    ProcessStatus::Suspended,
                    ProcessStatus::Resuming,
                )
                .await?
            {
                warn!(%instance_id, error = %err, "aborting resume, awaited children failed");
                self.queue.mark_failed(instance_id, &err.to_string()).await?;
            }
            return Ok(());
        }

        for failure in &failures {
            warn!(%instance_id, "{}, ignoring", failure);
        }

        if !self
            .queue
            .update_expected_status(instance_id, ProcessStatus::Suspended, ProcessStatus::Resuming)
            .await?
        {
            warn!(%instance_id, "duplicate resume signal rejected");
            return Ok(());
        }

        info!(
            %instance_id,
            resume_event = %condition.resume_event,
            "wait condition satisfied, resuming"
        );
        self.resumer.resume(instance_id, &condition, &outcomes).await
    }

    async fn find_statuses_with_retry(
        &self,
        ids: &[Uuid],
    ) -> Result<std::collections::BTreeMap<Uuid, Option<ProcessStatus>>> {
        let mut attempt = 0;
        loop {
            match self.queue.find_statuses(ids).await {
                Ok(statuses) => return Ok(statuses),
                Err(e) if e.is_transient() && attempt + 1 < self.retry_attempts => {
                    attempt += 1;
                    warn!(error = %e, attempt, "status poll failed, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn condition_wire_format() {
        let a = Uuid::new_v4();
        let condition = ProcessCompletionCondition {
            kind: PROCESS_COMPLETION.to_string(),
            reason: Some("Waiting for a child process to end".to_string()),
            processes: vec![a],
            resume_event: "ev-1".to_string(),
            resume_from_same_step: true,
            collect_out_vars: false,
            ignore_failures: false,
        };

        let value = serde_json::to_value(&condition).unwrap();
        assert_eq!(value["type"], json!("PROCESS_COMPLETION"));
        assert_eq!(value["resumeEvent"], json!("ev-1"));
        assert_eq!(value["processes"], json!([a.to_string()]));
        assert_eq!(value["resumeFromSameStep"], json!(true));
    }

    #[test]
    fn condition_defaults_on_deserialize() {
        let condition: ProcessCompletionCondition = serde_json::from_value(json!({
            "type": "PROCESS_COMPLETION",
            "processes": [],
            "resumeEvent": "ev-2"
        }))
        .unwrap();

        assert!(!condition.resume_from_same_step);
        assert!(!condition.collect_out_vars);
        assert!(!condition.ignore_failures);
        assert!(condition.reason.is_none());
    }

    #[test]
    fn awaiting_generates_fresh_event_names() {
        let c1 = ProcessCompletionCondition::awaiting(vec![], "r");
        let c2 = ProcessCompletionCondition::awaiting(vec![], "r");
        assert_ne!(c1.resume_event, c2.resume_event);
        assert_eq!(c1.kind, PROCESS_COMPLETION);
    }
}
