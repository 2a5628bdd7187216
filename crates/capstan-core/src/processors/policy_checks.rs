//! Policy enforcement processors: fork depth, queue admission and raw
//! payload size.
//!
//! A missing policy or rule means the check is skipped (fail open in the
//! absence of configuration); a configured and exceeded rule faults.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{OrchestratorError, Result};
use crate::payload::Payload;
use crate::pipeline::{Chain, Processor};
use crate::policy::{CheckResult, LimitScope, PolicySource};
use crate::queue::{CountScope, ProcessQueueManager};

fn log_warnings(payload: &Payload, rule: &str, result: &CheckResult) {
    for w in &result.warn {
        warn!(instance_id = %payload.process_key, rule, "{}", w);
    }
}

/// Resolves the effective policy for the submission and attaches it to the
/// payload. Skips when a policy is already attached.
pub struct PolicyResolveProcessor {
    source: Arc<dyn PolicySource>,
}

impl PolicyResolveProcessor {
    /// Create the processor.
    pub fn new(source: Arc<dyn PolicySource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Processor for PolicyResolveProcessor {
    async fn process(&self, chain: Chain, payload: Payload) -> Result<Payload> {
        if payload.policy.is_some() {
            return chain.process(payload).await;
        }

        let policy = self
            .source
            .policy_for(
                payload.organization_id,
                payload.project_id,
                payload.initiator.as_deref(),
            )
            .await?;

        let payload = match policy {
            Some(doc) => payload.with_policy(Arc::new(doc)),
            None => payload,
        };
        chain.process(payload).await
    }
}

/// Bounds recursive fork depth by walking the parent links in the queue.
pub struct ForkDepthPolicyProcessor {
    queue: ProcessQueueManager,
}

impl ForkDepthPolicyProcessor {
    /// Create the processor.
    pub fn new(queue: ProcessQueueManager) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Processor for ForkDepthPolicyProcessor {
    async fn process(&self, chain: Chain, payload: Payload) -> Result<Payload> {
        let Some(rule) = payload.policy.as_ref().and_then(|p| p.fork_depth.clone()) else {
            return chain.process(payload).await;
        };

        let depth = self
            .queue
            .ancestor_depth(payload.process_key.instance_id)
            .await?;

        let result = rule.check(depth);
        log_warnings(&payload, "fork-depth", &result);
        if result.is_denied() {
            return Err(OrchestratorError::PolicyViolation {
                message: result.deny.join("; "),
            });
        }

        chain.process(payload).await
    }
}

/// Caps the number of concurrently queued/running processes globally, per
/// organization and per project.
///
/// Check-then-act without a lock: two simultaneous admissions can both
/// observe a count just under the limit. The limit is a soft bound.
pub struct QueuePolicyProcessor {
    queue: ProcessQueueManager,
}

impl QueuePolicyProcessor {
    /// Create the processor.
    pub fn new(queue: ProcessQueueManager) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Processor for QueuePolicyProcessor {
    async fn process(&self, chain: Chain, payload: Payload) -> Result<Payload> {
        let Some(rules) = payload
            .policy
            .as_ref()
            .and_then(|p| p.queue_process.clone())
        else {
            return chain.process(payload).await;
        };

        let mut denials = Vec::new();
        for rule in &rules.limits {
            let scope = match rule.scope {
                LimitScope::Process => CountScope::All,
                LimitScope::Org => match payload.organization_id {
                    Some(id) => CountScope::Org(id),
                    None => continue,
                },
                LimitScope::Project => match payload.project_id {
                    Some(id) => CountScope::Project(id),
                    None => continue,
                },
            };

            // The submission's own NEW row is excluded; the rule bounds
            // everyone else already in the queue.
            let count = self
                .queue
                .count_in_statuses(scope, &rule.statuses, Some(payload.process_key.instance_id))
                .await?;
            let result = rule.check(count);
            log_warnings(&payload, "queue-process", &result);
            denials.extend(result.deny);
        }

        if !denials.is_empty() {
            return Err(OrchestratorError::TooManyRequests {
                message: denials.join("; "),
            });
        }

        chain.process(payload).await
    }
}

/// Bounds the total size of the raw request payload.
pub struct RawPayloadPolicyProcessor;

#[async_trait]
impl Processor for RawPayloadPolicyProcessor {
    async fn process(&self, chain: Chain, payload: Payload) -> Result<Payload> {
        let rule = payload.policy.as_ref().and_then(|p| p.raw_payload.clone());
        let (Some(rule), Some(size)) = (rule, payload.raw_payload_size) else {
            return chain.process(payload).await;
        };

        let result = rule.check(size);
        log_warnings(&payload, "raw-payload", &result);
        if result.is_denied() {
            return Err(OrchestratorError::PolicyViolation {
                message: result.deny.join("; "),
            });
        }

        chain.process(payload).await
    }
}
