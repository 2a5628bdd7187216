//! The process task: start, fork, kill and await child processes from
//! inside a running workflow.
//!
//! The task is a thin caller of the server's queue and resume primitives.
//! Synchronous waits either block (polling with a fixed delay) or suspend
//! the calling process on a wait condition, to be resumed by event; a
//! reentrant suspend restarts the same task step, which makes
//! `sync: true, suspend: true` look like an ordinary blocking call to the
//! workflow author.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{ProcessApi, ProcessEntry, with_retry};
use crate::error::{Result, TaskError};
use crate::params::{ForkParams, KillParams, StartParams, TaskParams};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_POLL_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a task call.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    /// The call completed; `values` go back to the workflow.
    Success {
        /// Result values exposed to the workflow.
        values: Map<String, Value>,
    },
    /// The calling process must suspend until the event fires.
    Suspend {
        /// The resume event name.
        event: String,
    },
    /// Suspend, and restart this exact task step on resume.
    ReentrantSuspend {
        /// The resume event name.
        event: String,
        /// State handed back to the step on re-entry.
        payload: Value,
    },
}

/// State carried across a reentrant suspend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePayload {
    /// The awaited processes.
    pub jobs: Vec<Uuid>,
    /// Collect the children's output variables on resume.
    pub collect_out_vars: bool,
    /// Downgrade child failures from fault to warning.
    pub ignore_failures: bool,
}

impl ResumePayload {
    /// Serialize for the reentrant-suspend payload.
    pub fn as_value(&self) -> Value {
        json!({
            "jobs": self.jobs,
            "collectOutVars": self.collect_out_vars,
            "ignoreFailures": self.ignore_failures,
        })
    }

    /// Parse back from a reentrant-suspend payload.
    pub fn from_value(value: &Value) -> Result<Self> {
        let jobs = value
            .get("jobs")
            .and_then(Value::as_array)
            .ok_or_else(|| TaskError::InvalidParams("resume payload missing 'jobs'".into()))?
            .iter()
            .map(|v| {
                v.as_str()
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .ok_or_else(|| TaskError::InvalidParams("invalid job id".into()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            jobs,
            collect_out_vars: value
                .get("collectOutVars")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            ignore_failures: value
                .get("ignoreFailures")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

/// The client task surface.
pub struct ProcessTask {
    api: Arc<dyn ProcessApi>,
    current_process_id: Uuid,
    poll_delay: Duration,
    kill_timeout: Duration,
}

impl ProcessTask {
    /// Create a task bound to the current process.
    pub fn new(api: Arc<dyn ProcessApi>, current_process_id: Uuid) -> Self {
        Self {
            api,
            current_process_id,
            poll_delay: DEFAULT_POLL_DELAY,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
        }
    }

    /// Override the delay between status polls.
    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    /// Execute a task call from its JSON-shaped input map.
    pub async fn execute(&self, input: &Map<String, Value>) -> Result<TaskResult> {
        match TaskParams::from_map(input)? {
            TaskParams::Start(params) => self.start(params, Some(self.current_process_id)).await,
            TaskParams::StartExternal(params) => self.start(params, None).await,
            TaskParams::Fork(params) => self.fork(params).await,
            TaskParams::Kill(params) => {
                self.kill(params).await?;
                Ok(TaskResult::Success { values: Map::new() })
            }
        }
    }

    async fn start(&self, params: StartParams, parent: Option<Uuid>) -> Result<TaskResult> {
        let mut input = Map::new();
        for (key, value) in [
            ("org", params.org.clone().map(Value::from)),
            ("project", params.project.clone().map(Value::from)),
            ("repo", params.repo.clone().map(Value::from)),
            ("entryPoint", params.entry_point.clone().map(Value::from)),
            ("baseUrl", params.base_url.clone().map(Value::from)),
            (
                "parentInstanceId",
                parent.map(|p| Value::from(p.to_string())),
            ),
        ] {
            if let Some(value) = value {
                input.insert(key.to_string(), value);
            }
        }
        if !params.arguments.is_empty() {
            input.insert(
                "arguments".to_string(),
                Value::Object(params.arguments.clone()),
            );
        }
        if !params.active_profiles.is_empty() {
            input.insert(
                "activeProfiles".to_string(),
                json!(params.active_profiles),
            );
        }

        let response =
            with_retry(RETRY_ATTEMPTS, RETRY_DELAY, || self.api.start(input.clone())).await?;
        let id = response.instance_id;
        info!(process = %id, "started a process");

        if !params.sync {
            return Ok(TaskResult::Success {
                values: Map::from_iter([("id".to_string(), json!(id))]),
            });
        }

        if params.suspend {
            info!(process = %id, "suspending until the child process is completed");
            return self
                .suspend(
                    ResumePayload {
                        jobs: vec![id],
                        collect_out_vars: !params.out_vars.is_empty(),
                        ignore_failures: params.ignore_failures,
                    },
                    true,
                )
                .await;
        }

        let entries = self.wait_for_completion(&[id], None).await?;
        handle_results(&entries, params.ignore_failures)?;

        let mut values = Map::from_iter([("id".to_string(), json!(id))]);
        if !params.out_vars.is_empty() {
            let out = with_retry(RETRY_ATTEMPTS, RETRY_DELAY, || self.api.out_variables(id))
                .await?;
            values.extend(out);
        }
        Ok(TaskResult::Success { values })
    }

    async fn fork(&self, params: ForkParams) -> Result<TaskResult> {
        let mut set: JoinSet<(usize, Result<Uuid>)> = JoinSet::new();
        let mut position = 0usize;

        for group in &params.forks {
            for _ in 0..group.instances {
                let api = self.api.clone();
                let parent = self.current_process_id;
                let slot = position;
                position += 1;

                let mut request = Map::new();
                request.insert("entryPoint".to_string(), json!(group.entry_point));
                if !group.arguments.is_empty() {
                    request.insert(
                        "arguments".to_string(),
                        Value::Object(group.arguments.clone()),
                    );
                }
                if !group.out_vars.is_empty() {
                    request.insert("outVars".to_string(), json!(group.out_vars));
                }

                set.spawn(async move {
                    let result =
                        with_retry(RETRY_ATTEMPTS, RETRY_DELAY, || api.fork(parent, request.clone()))
                            .await
                            .map(|r| r.instance_id);
                    (slot, result)
                });
            }
        }

        // Collect every submission before reporting, so the caller learns
        // all assigned ids even under partial failure.
        let mut ids: Vec<Option<Uuid>> = vec![None; position];
        let mut errors = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((slot, Ok(id))) => {
                    info!(child = %id, "forked a child process");
                    ids[slot] = Some(id);
                }
                Ok((slot, Err(e))) => errors.push(format!("fork {}: {}", slot, e)),
                Err(e) => errors.push(format!("fork task failed: {}", e)),
            }
        }
        if !errors.is_empty() {
            errors.sort();
            return Err(TaskError::ChildFailures(format!(
                "Fork submission failure(s): {}",
                errors.join("; ")
            )));
        }
        let ids: Vec<Uuid> = ids.into_iter().flatten().collect();

        if params.sync {
            if params.suspend {
                info!(?ids, "suspending until the fork processes are completed");
                let collect_out_vars = params.forks.iter().any(|f| !f.out_vars.is_empty());
                return self
                    .suspend(
                        ResumePayload {
                            jobs: ids,
                            collect_out_vars,
                            ignore_failures: params.ignore_failures,
                        },
                        true,
                    )
                    .await;
            }

            let entries = self.wait_for_completion(&ids, None).await?;
            handle_results(&entries, params.ignore_failures)?;
        }

        Ok(TaskResult::Success {
            values: Map::from_iter([("forks".to_string(), json!(ids))]),
        })
    }

    async fn kill(&self, params: KillParams) -> Result<()> {
        for id in &params.ids {
            with_retry(RETRY_ATTEMPTS, RETRY_DELAY, || self.api.kill(*id)).await?;
            if params.sync {
                self.wait_for_completion(&[*id], Some(self.kill_timeout))
                    .await?;
            }
        }
        Ok(())
    }

    /// Poll the given processes until every one reaches a terminal status.
    pub async fn wait_for_completion(
        &self,
        ids: &[Uuid],
        timeout: Option<Duration>,
    ) -> Result<BTreeMap<Uuid, ProcessEntry>> {
        let started = tokio::time::Instant::now();
        let mut pending: Vec<Uuid> = ids.to_vec();
        let mut done = BTreeMap::new();

        while !pending.is_empty() {
            let mut still_pending = Vec::new();
            for id in pending {
                let entry =
                    with_retry(RETRY_ATTEMPTS, RETRY_DELAY, || self.api.entry(id)).await?;
                if entry.is_final() {
                    done.insert(id, entry);
                } else {
                    still_pending.push(id);
                }
            }
            pending = still_pending;

            if pending.is_empty() {
                break;
            }

            if let Some(timeout) = timeout {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    return Err(TaskError::Timeout {
                        instance_id: pending[0],
                        elapsed_ms: elapsed.as_millis(),
                    });
                }
            }

            tokio::time::sleep(self.poll_delay).await;
        }

        Ok(done)
    }

    /// Suspend the current process until the given processes finish.
    ///
    /// Returns the suspend result carrying the freshly generated resume
    /// event name.
    pub async fn suspend_for_completion(&self, ids: Vec<Uuid>) -> Result<TaskResult> {
        self.suspend(
            ResumePayload {
                jobs: ids,
                collect_out_vars: false,
                ignore_failures: false,
            },
            false,
        )
        .await
    }

    async fn suspend(&self, payload: ResumePayload, resume_from_same_step: bool) -> Result<TaskResult> {
        let event = Uuid::new_v4().to_string();
        let condition = json!({
            "type": "PROCESS_COMPLETION",
            "reason": "Waiting for a child process to end",
            "processes": payload.jobs,
            "resumeEvent": event,
            "resumeFromSameStep": resume_from_same_step,
            "collectOutVars": payload.collect_out_vars,
            "ignoreFailures": payload.ignore_failures,
        });

        with_retry(RETRY_ATTEMPTS, RETRY_DELAY, || {
            self.api
                .set_wait_condition(self.current_process_id, condition.clone())
        })
        .await?;

        if resume_from_same_step {
            Ok(TaskResult::ReentrantSuspend {
                event,
                payload: payload.as_value(),
            })
        } else {
            Ok(TaskResult::Suspend { event })
        }
    }

    /// Finish a reentrant suspend: collect the awaited processes' results.
    ///
    /// With exactly one awaited process its output variables are exposed
    /// flattened at the top level; with several they are nested under each
    /// process' id.
    pub async fn continue_after_suspend(&self, payload: &ResumePayload) -> Result<TaskResult> {
        let mut entries = BTreeMap::new();
        let mut outs = Vec::with_capacity(payload.jobs.len());

        for id in &payload.jobs {
            let entry = with_retry(RETRY_ATTEMPTS, RETRY_DELAY, || self.api.entry(*id)).await?;
            if !entry.is_final() {
                return Err(TaskError::NotFinished { instance_id: *id });
            }

            let out = if payload.collect_out_vars {
                with_retry(RETRY_ATTEMPTS, RETRY_DELAY, || self.api.out_variables(*id)).await?
            } else {
                Map::new()
            };

            entries.insert(*id, entry);
            outs.push((*id, out));
        }

        handle_results(&entries, payload.ignore_failures)?;

        let values = if payload.jobs.len() == 1 {
            // A single job's variables land at the top level, e.g.
            // jobOut.someVar.
            outs.pop().map(|(_, out)| out).unwrap_or_default()
        } else {
            // Multiple jobs nest under their ids, e.g.
            // jobOut['<id>'].someVar.
            let mut nested = Map::new();
            for (id, out) in outs {
                if !out.is_empty() {
                    nested.insert(id.to_string(), Value::Object(out));
                }
            }
            nested
        };

        Ok(TaskResult::Success { values })
    }
}

/// Fault on failed children unless failures are ignored; the aggregate
/// message names every failed process and its recorded error.
fn handle_results(entries: &BTreeMap<Uuid, ProcessEntry>, ignore_failures: bool) -> Result<()> {
    let mut errors = String::new();
    for (id, entry) in entries {
        if !entry.is_failed() {
            continue;
        }

        let error_suffix = entry
            .error
            .as_ref()
            .map(|e| format!(" (error: {})", e))
            .unwrap_or_default();

        if ignore_failures {
            warn!(process = %id, status = %entry.status, "child process failed, ignoring");
            continue;
        }

        errors.push_str(&format!(
            "Child process {} {}{}\n",
            id, entry.status, error_suffix
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(TaskError::ChildFailures(errors))
    }
}
