// Copyright (C) 2026 Capstan Contributors
// SPDX-License-Identifier: Apache-2.0
//! The process manager: builds payloads, owns the pipeline registry and
//! exposes the start/fork/resume/kill operations.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::{DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_DELAY};
use crate::error::{ChildFailure, OrchestratorError, Result};
use crate::external::{Dispatcher, RepositoryResolver};
use crate::fork::{ForkCoordinator, ForkGroup, ForkRequest, ForkSubmitter};
use crate::payload::Payload;
use crate::pipeline::{Pipeline, PipelineRegistry};
use crate::policy::PolicySource;
use crate::process::{ProcessKey, ProcessKind, ProcessStatus};
use crate::processors::{
    CancelProcessor, ConfigurationProcessor, DispatchProcessor, EnqueueProcessor,
    ExclusiveGroupProcessor, ForkDepthPolicyProcessor, InitialQueueEntryProcessor,
    PolicyResolveProcessor, QueueFailureHandler, QueuePolicyProcessor, RawPayloadPolicyProcessor,
    RepositoryProcessor, ResumeDataProcessor, ResumeValidationProcessor, ValidationProcessor,
};
use crate::queue::{ProcessQueueManager, QueueStore};
use crate::waits::{
    ChildOutcome, ProcessCompletionCondition, ProcessResumer, ProcessWaitService,
};

/// Pipeline handling brand-new process submissions.
pub const NEW_PROCESS_PIPELINE: &str = "new-process";
/// Pipeline handling fork submissions.
pub const FORK_PROCESS_PIPELINE: &str = "fork-process";
/// Pipeline handling resumes of suspended processes.
pub const RESUME_PROCESS_PIPELINE: &str = "resume-process";
/// Pipeline handling kill requests.
pub const KILL_PROCESS_PIPELINE: &str = "kill-process";

/// A request to start a new process.
#[derive(Debug, Clone, Default)]
pub struct ProcessRequest {
    /// The owning organization.
    pub organization_id: Option<Uuid>,
    /// The owning project.
    pub project_id: Option<Uuid>,
    /// The source repository, if registered.
    pub repository_id: Option<Uuid>,
    /// The kind of process.
    pub kind: ProcessKind,
    /// Who is starting the process.
    pub initiator: Option<String>,
    /// The workflow entry point.
    pub entry_point: Option<String>,
    /// The request's own configuration layer.
    pub configuration: Map<String, Value>,
    /// Intake-supplied headers (defaults, profiles, repo references).
    pub headers: BTreeMap<String, Value>,
    /// Staged attachment files, keyed by name.
    pub attachments: BTreeMap<String, PathBuf>,
    /// Total raw request size, if known.
    pub raw_payload_size: Option<u64>,
    /// Explicitly requested active profiles.
    pub active_profiles: Vec<String>,
    /// Output expressions to collect.
    pub out_expressions: BTreeSet<String>,
    /// Free-form tags.
    pub tags: BTreeSet<String>,
    /// Mutual-exclusion group.
    pub exclusive_group: Option<String>,
}

/// Result of a start submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOutcome {
    /// The assigned process key.
    pub key: ProcessKey,
    /// The status after the pipeline committed (`Enqueued`, or `Cancelled`
    /// when an exclusive-group conflict stopped the submission).
    pub status: ProcessStatus,
}

/// Result of a fork request.
#[derive(Debug, Clone)]
pub enum ForkOutcome {
    /// Asynchronous fork: every child was submitted.
    Submitted {
        /// The children's keys in submission order.
        keys: Vec<ProcessKey>,
    },
    /// Synchronous fork with `suspend`: the parent persisted a wait
    /// condition and must yield its execution slot.
    Suspended {
        /// The children's keys in submission order.
        keys: Vec<ProcessKey>,
        /// The event the parent resumes on.
        resume_event: String,
    },
    /// Synchronous blocking fork: every child reached a terminal status.
    Completed {
        /// The children's keys in submission order.
        keys: Vec<ProcessKey>,
        /// The children's terminal outcomes.
        outcomes: Vec<ChildOutcome>,
    },
}

/// Builder for a [`ProcessManager`].
pub struct ProcessManagerBuilder {
    store: Option<Arc<dyn QueueStore>>,
    policy_source: Arc<dyn PolicySource>,
    repository_resolver: Arc<dyn RepositoryResolver>,
    dispatcher: Arc<dyn Dispatcher>,
    fork_pool_size: usize,
    sync_poll_delay: Duration,
}

impl Default for ProcessManagerBuilder {
    fn default() -> Self {
        Self {
            store: None,
            policy_source: Arc::new(crate::policy::NoPolicies),
            repository_resolver: Arc::new(crate::external::NoRepositories),
            dispatcher: Arc::new(crate::external::NoopDispatcher),
            fork_pool_size: 8,
            sync_poll_delay: Duration::from_secs(5),
        }
    }
}

impl ProcessManagerBuilder {
    /// Create a new builder with default collaborators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue store (required).
    pub fn store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the policy source.
    pub fn policy_source(mut self, source: Arc<dyn PolicySource>) -> Self {
        self.policy_source = source;
        self
    }

    /// Set the repository resolver.
    pub fn repository_resolver(mut self, resolver: Arc<dyn RepositoryResolver>) -> Self {
        self.repository_resolver = resolver;
        self
    }

    /// Set the runner dispatcher.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Set the fork worker pool size.
    pub fn fork_pool_size(mut self, size: usize) -> Self {
        self.fork_pool_size = size;
        self
    }

    /// Set the delay between status polls in blocking waits.
    pub fn sync_poll_delay(mut self, delay: Duration) -> Self {
        self.sync_poll_delay = delay;
        self
    }

    /// Build the manager and its pipeline registry.
    pub fn build(self) -> Result<Arc<ProcessManager>> {
        let store = self.store.ok_or_else(|| OrchestratorError::ValidationError {
            field: "store".to_string(),
            message: "a queue store is required".to_string(),
        })?;

        Ok(ProcessManager::assemble(
            store,
            self.policy_source,
            self.repository_resolver,
            self.dispatcher,
            self.fork_pool_size,
            self.sync_poll_delay,
        ))
    }
}

/// Orchestrates process lifecycles through the named pipelines.
pub struct ProcessManager {
    queue: ProcessQueueManager,
    registry: Arc<PipelineRegistry>,
    wait_service: ProcessWaitService,
    fork_coordinator: ForkCoordinator,
    sync_poll_delay: Duration,
}

impl ProcessManager {
    /// Create a new builder.
    pub fn builder() -> ProcessManagerBuilder {
        ProcessManagerBuilder::new()
    }

    fn assemble(
        store: Arc<dyn QueueStore>,
        policy_source: Arc<dyn PolicySource>,
        repository_resolver: Arc<dyn RepositoryResolver>,
        dispatcher: Arc<dyn Dispatcher>,
        fork_pool_size: usize,
        sync_poll_delay: Duration,
    ) -> Arc<Self> {
        let queue = ProcessQueueManager::new(store);
        let fault_handler = Arc::new(QueueFailureHandler::new(queue.clone()));

        let registry = PipelineRegistry::new()
            .register(Pipeline::new(
                NEW_PROCESS_PIPELINE,
                vec![
                    Arc::new(ValidationProcessor),
                    Arc::new(InitialQueueEntryProcessor::new(queue.clone())),
                    Arc::new(PolicyResolveProcessor::new(policy_source.clone())),
                    Arc::new(ConfigurationProcessor),
                    Arc::new(RawPayloadPolicyProcessor),
                    Arc::new(QueuePolicyProcessor::new(queue.clone())),
                    Arc::new(RepositoryProcessor::new(
                        repository_resolver.clone(),
                        queue.clone(),
                    )),
                    Arc::new(ExclusiveGroupProcessor::new(queue.clone())),
                    Arc::new(EnqueueProcessor::new(queue.clone())),
                ],
                fault_handler.clone(),
            ))
            .register(Pipeline::new(
                FORK_PROCESS_PIPELINE,
                vec![
                    Arc::new(ValidationProcessor),
                    Arc::new(InitialQueueEntryProcessor::new(queue.clone())),
                    Arc::new(PolicyResolveProcessor::new(policy_source)),
                    Arc::new(ConfigurationProcessor),
                    Arc::new(ForkDepthPolicyProcessor::new(queue.clone())),
                    Arc::new(QueuePolicyProcessor::new(queue.clone())),
                    Arc::new(EnqueueProcessor::new(queue.clone())),
                ],
                fault_handler.clone(),
            ))
            .register(Pipeline::new(
                RESUME_PROCESS_PIPELINE,
                vec![
                    Arc::new(ResumeValidationProcessor),
                    Arc::new(ResumeDataProcessor),
                    Arc::new(DispatchProcessor::new(dispatcher, queue.clone())),
                ],
                fault_handler.clone(),
            ))
            .register(Pipeline::new(
                KILL_PROCESS_PIPELINE,
                vec![Arc::new(CancelProcessor::new(queue.clone()))],
                fault_handler,
            ));

        Arc::new(Self {
            wait_service: ProcessWaitService::new(queue.clone()),
            fork_coordinator: ForkCoordinator::new(fork_pool_size),
            queue,
            registry: Arc::new(registry),
            sync_poll_delay,
        })
    }

    /// The queue manager, for runner callbacks and metrics queries.
    pub fn queue(&self) -> &ProcessQueueManager {
        &self.queue
    }

    /// The suspend service.
    pub fn waits(&self) -> &ProcessWaitService {
        &self.wait_service
    }

    /// Start a new process.
    ///
    /// The returned status is `Enqueued`, or `Cancelled` when an
    /// exclusive-group conflict stopped the submission cleanly.
    #[instrument(skip(self, request), fields(initiator = ?request.initiator))]
    pub async fn start(&self, request: ProcessRequest) -> Result<StartOutcome> {
        let key = ProcessKey::generate();
        info!(instance_id = %key, "starting process");

        let mut payload = Payload::new(key);
        payload.organization_id = request.organization_id;
        payload.project_id = request.project_id;
        payload.repository_id = request.repository_id;
        payload.kind = request.kind;
        payload.initiator = request.initiator;
        payload.entry_point = request.entry_point;
        payload.configuration = request.configuration;
        payload.headers = request.headers;
        payload.attachments = request.attachments;
        payload.raw_payload_size = request.raw_payload_size;
        payload.active_profiles = request.active_profiles;
        payload.out_expressions = request.out_expressions;
        payload.tags = request.tags;
        payload.exclusive_group = request.exclusive_group;

        self.registry.expect(NEW_PROCESS_PIPELINE)?.process(payload).await?;

        let status = self.queue.expect_status(key.instance_id).await?;
        Ok(StartOutcome { key, status })
    }

    /// Fork children of a running process.
    #[instrument(skip(self, request), fields(parent = %parent_instance_id))]
    pub async fn fork(
        &self,
        parent_instance_id: Uuid,
        request: ForkRequest,
    ) -> Result<ForkOutcome> {
        let parent = self.queue.expect_entry(parent_instance_id).await?;

        let submitter: Arc<dyn ForkSubmitter> = Arc::new(PipelineForkSubmitter {
            queue: self.queue.clone(),
            registry: self.registry.clone(),
        });
        let keys = self
            .fork_coordinator
            .submit_all(submitter, parent.key(), &request.groups)
            .await?;

        if !request.sync {
            return Ok(ForkOutcome::Submitted { keys });
        }

        if request.suspend {
            let collect_out_vars = request
                .groups
                .iter()
                .any(|g| !g.out_expressions.is_empty());
            let mut condition = ProcessCompletionCondition::awaiting(
                keys.iter().map(|k| k.instance_id).collect(),
                "Waiting for forked process(es) to end",
            );
            condition.resume_from_same_step = true;
            condition.collect_out_vars = collect_out_vars;
            condition.ignore_failures = request.ignore_failures;

            let resume_event = self
                .wait_service
                .suspend(parent_instance_id, &condition)
                .await?;
            return Ok(ForkOutcome::Suspended { keys, resume_event });
        }

        let outcomes = self
            .wait_for_terminal(&keys.iter().map(|k| k.instance_id).collect::<Vec<_>>())
            .await?;

        let failures: Vec<ChildFailure> = outcomes
            .iter()
            .filter(|o| !o.is_success())
            .map(|o| ChildFailure {
                instance_id: o.instance_id,
                status: o.status.as_str().to_string(),
                error: o.error.clone(),
            })
            .collect();

        if !failures.is_empty() {
            if request.ignore_failures {
                for f in &failures {
                    warn!(parent = %parent_instance_id, "{}, ignoring", f);
                }
            } else {
                return Err(OrchestratorError::ChildFailures { failures });
            }
        }

        Ok(ForkOutcome::Completed { keys, outcomes })
    }

    /// Block until every process in `ids` reaches a terminal status.
    pub async fn wait_for_terminal(&self, ids: &[Uuid]) -> Result<Vec<ChildOutcome>> {
        loop {
            let statuses = self.find_statuses_with_retry(ids).await?;
            let all_terminal = ids.iter().all(|id| {
                statuses
                    .get(id)
                    .map(|s| s.map(ProcessStatus::is_terminal).unwrap_or(true))
                    .unwrap_or(true)
            });
            if all_terminal {
                break;
            }
            tokio::time::sleep(self.sync_poll_delay).await;
        }

        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
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
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn find_statuses_with_retry(
        &self,
        ids: &[Uuid],
    ) -> Result<BTreeMap<Uuid, Option<ProcessStatus>>> {
        let mut attempt = 0;
        loop {
            match self.queue.find_statuses(ids).await {
                Ok(statuses) => return Ok(statuses),
                Err(e) if e.is_transient() && attempt + 1 < DEFAULT_RETRY_ATTEMPTS => {
                    attempt += 1;
                    warn!(error = %e, attempt, "status poll failed, retrying");
                    tokio::time::sleep(DEFAULT_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resume a suspended process on an external resume request.
    ///
    /// The `SUSPENDED -> RESUMING` compare-and-swap rejects racing
    /// duplicate requests; exactly one wins.
    #[instrument(skip(self, configuration))]
    pub async fn resume_process(
        &self,
        instance_id: Uuid,
        resume_event: &str,
        configuration: Map<String, Value>,
    ) -> Result<()> {
        let flipped = self
            .queue
            .update_expected_status(instance_id, ProcessStatus::Suspended, ProcessStatus::Resuming)
            .await?;
        if !flipped {
            let actual = self.queue.expect_status(instance_id).await?;
            return Err(OrchestratorError::InvalidProcessState {
                instance_id,
                expected: ProcessStatus::Suspended.as_str().to_string(),
                actual: actual.as_str().to_string(),
            });
        }

        self.run_resume_pipeline(instance_id, resume_event, configuration, false)
            .await
    }

    async fn run_resume_pipeline(
        &self,
        instance_id: Uuid,
        resume_event: &str,
        configuration: Map<String, Value>,
        resume_from_same_step: bool,
    ) -> Result<()> {
        let entry = self.queue.expect_entry(instance_id).await?;

        let mut payload = Payload::new(entry.key());
        payload.parent_instance_id = entry.parent_instance_id;
        payload.organization_id = entry.organization_id;
        payload.project_id = entry.project_id;
        payload.initiator = entry.initiator.clone();
        payload.resume_event = Some(resume_event.to_string());
        payload.configuration = configuration;
        if resume_from_same_step {
            payload
                .configuration
                .insert("resumeFromSameStep".to_string(), json!(true));
        }

        self.registry
            .expect(RESUME_PROCESS_PIPELINE)?
            .process(payload)
            .await?;
        Ok(())
    }

    /// Kill a process. Terminal processes are a no-op.
    #[instrument(skip(self))]
    pub async fn kill(&self, instance_id: Uuid) -> Result<()> {
        let entry = self.queue.expect_entry(instance_id).await?;
        self.registry
            .expect(KILL_PROCESS_PIPELINE)?
            .process(Payload::new(entry.key()))
            .await?;
        Ok(())
    }
}

/// Runs the fork pipeline for each submitted child.
struct PipelineForkSubmitter {
    queue: ProcessQueueManager,
    registry: Arc<PipelineRegistry>,
}

#[async_trait]
impl ForkSubmitter for PipelineForkSubmitter {
    async fn submit(&self, parent: ProcessKey, group: ForkGroup, index: u32) -> Result<ProcessKey> {
        let parent_entry = self.queue.expect_entry(parent.instance_id).await?;

        let key = ProcessKey::generate();
        let mut payload = Payload::new(key);
        payload.parent_instance_id = Some(parent.instance_id);
        payload.organization_id = parent_entry.organization_id;
        payload.project_id = parent_entry.project_id;
        payload.repository_id = parent_entry.repository.repo_id;
        payload.initiator = parent_entry.initiator.clone();
        payload.entry_point = Some(group.entry_point.clone());
        payload.configuration = group.configuration.clone();
        payload.out_expressions = group.out_expressions.iter().cloned().collect();
        payload.tags = parent_entry.tags.iter().cloned().collect();

        info!(
            parent = %parent,
            child = %key,
            entry_point = %group.entry_point,
            index,
            "forking child process"
        );

        self.registry
            .expect(FORK_PROCESS_PIPELINE)?
            .process(payload)
            .await?;
        Ok(key)
    }
}

#[async_trait]
impl ProcessResumer for ProcessManager {
    async fn resume(
        &self,
        instance_id: Uuid,
        condition: &ProcessCompletionCondition,
        outcomes: &[ChildOutcome],
    ) -> Result<()> {
        let awaited: Vec<Value> = outcomes
            .iter()
            .map(|o| {
                json!({
                    "instanceId": o.instance_id,
                    "status": o.status.as_str(),
                    "error": o.error,
                })
            })
            .collect();

        let mut configuration = Map::new();
        configuration.insert("awaited".to_string(), Value::Array(awaited));

        self.run_resume_pipeline(
            instance_id,
            &condition.resume_event,
            configuration,
            condition.resume_from_same_step,
        )
        .await
    }
}
