// Copyright (C) 2026 Capstan Contributors
// SPDX-License-Identifier: Apache-2.0
//! Policy documents and the policy-source boundary.
//!
//! Policies are supplied per organization/project by an external source
//! and enforced by dedicated pipeline processors. A missing rule means
//! "allow" (fail open in the absence of configuration); a configured and
//! exceeded rule denies.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::process::ProcessStatus;

/// Default deny message for the fork-depth rule.
pub const DEFAULT_FORK_DEPTH_MSG: &str =
    "Maximum number of forks exceeded: current {current}, limit {limit}";

/// Scope of a queue admission limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LimitScope {
    /// All processes on the server.
    Process,
    /// Processes of the submitting organization.
    Org,
    /// Processes of the submitting project.
    Project,
}

/// Bounds the recursive fork depth of a process tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkDepthRule {
    /// Maximum allowed ancestor depth.
    pub max_depth: i64,
    /// Optional message override; `{current}` and `{limit}` are expanded.
    #[serde(default)]
    pub msg: Option<String>,
}

impl ForkDepthRule {
    /// Check the supplied current depth against the limit.
    pub fn check(&self, current: i64) -> CheckResult {
        if current <= self.max_depth {
            return CheckResult::allow();
        }

        let template = self.msg.as_deref().unwrap_or(DEFAULT_FORK_DEPTH_MSG);
        let message = template
            .replace("{current}", &current.to_string())
            .replace("{limit}", &self.max_depth.to_string());
        CheckResult::deny(message)
    }
}

/// One queue admission limit: a count of entries in the given statuses,
/// at the given scope, must not exceed `max`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueLimitRule {
    /// The scope the count is taken over.
    pub scope: LimitScope,
    /// The statuses counted; typically the non-terminal ones.
    pub statuses: Vec<ProcessStatus>,
    /// The maximum allowed count.
    pub max: i64,
    /// Optional message override; `{count}` and `{limit}` are expanded.
    #[serde(default)]
    pub msg: Option<String>,
    /// When true the rule only warns instead of denying.
    #[serde(default)]
    pub warn_only: bool,
}

impl QueueLimitRule {
    /// Check a measured count against the limit.
    pub fn check(&self, count: i64) -> CheckResult {
        if count < self.max {
            return CheckResult::allow();
        }

        let template = self
            .msg
            .as_deref()
            .unwrap_or("Maximum number of queued processes exceeded: current {count}, limit {limit}");
        let message = template
            .replace("{count}", &count.to_string())
            .replace("{limit}", &self.max.to_string());

        if self.warn_only {
            CheckResult::warn(message)
        } else {
            CheckResult::deny(message)
        }
    }
}

/// Queue admission rules, evaluated before a process is enqueued.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueProcessRule {
    /// Every configured limit; all must pass.
    #[serde(default)]
    pub limits: Vec<QueueLimitRule>,
}

/// Bounds the total size of raw request payloads (staged attachments).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPayloadRule {
    /// Maximum allowed size in bytes.
    pub max_size_bytes: u64,
    /// Optional message override.
    #[serde(default)]
    pub msg: Option<String>,
}

impl RawPayloadRule {
    /// Check the supplied payload size against the limit.
    pub fn check(&self, size: u64) -> CheckResult {
        if size <= self.max_size_bytes {
            return CheckResult::allow();
        }

        let template = self
            .msg
            .as_deref()
            .unwrap_or("Maximum payload size exceeded: current {current}, limit {limit}");
        let message = template
            .replace("{current}", &size.to_string())
            .replace("{limit}", &self.max_size_bytes.to_string());
        CheckResult::deny(message)
    }
}

/// The per-org/project rule set enforced by the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    /// Fork-depth rule, if configured.
    #[serde(default)]
    pub fork_depth: Option<ForkDepthRule>,
    /// Queue admission rules, if configured.
    #[serde(default)]
    pub queue_process: Option<QueueProcessRule>,
    /// Raw payload size rule, if configured.
    #[serde(default)]
    pub raw_payload: Option<RawPayloadRule>,
}

/// Outcome of evaluating a policy rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckResult {
    /// Rule matches that deny the operation.
    pub deny: Vec<String>,
    /// Rule matches that only warn.
    pub warn: Vec<String>,
}

impl CheckResult {
    /// An empty, allowing result.
    pub fn allow() -> Self {
        Self::default()
    }

    /// A result with a single denial.
    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            deny: vec![message.into()],
            warn: Vec::new(),
        }
    }

    /// A result with a single warning.
    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            deny: Vec::new(),
            warn: vec![message.into()],
        }
    }

    /// Fold another result into this one.
    pub fn merge(mut self, other: CheckResult) -> Self {
        self.deny.extend(other.deny);
        self.warn.extend(other.warn);
        self
    }

    /// Whether any rule denied.
    pub fn is_denied(&self) -> bool {
        !self.deny.is_empty()
    }
}

/// External source of policy documents.
///
/// Implementations live outside the core (typically backed by the org/
/// project metadata store).
#[async_trait::async_trait]
pub trait PolicySource: Send + Sync {
    /// Resolve the effective policy for a submission, if any is configured.
    async fn policy_for(
        &self,
        organization_id: Option<Uuid>,
        project_id: Option<Uuid>,
        initiator: Option<&str>,
    ) -> Result<Option<PolicyDocument>>;
}

/// A policy source with no policies configured.
pub struct NoPolicies;

#[async_trait::async_trait]
impl PolicySource for NoPolicies {
    async fn policy_for(
        &self,
        _organization_id: Option<Uuid>,
        _project_id: Option<Uuid>,
        _initiator: Option<&str>,
    ) -> Result<Option<PolicyDocument>> {
        Ok(None)
    }
}
