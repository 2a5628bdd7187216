// Copyright (C) 2026 Capstan Contributors
// SPDX-License-Identifier: Apache-2.0
//! Process identity and status types.
//!
//! A process is one run instance of a workflow. Its identity is a
//! [`ProcessKey`]: an instance id plus the creation timestamp, minted once
//! when the process is first enqueued or forked and never reused.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique identity of one process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessKey {
    /// The process instance id.
    pub instance_id: Uuid,
    /// When the process was first enqueued or forked.
    pub created_at: DateTime<Utc>,
}

impl ProcessKey {
    /// Mint a fresh key for a new process.
    pub fn generate() -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    /// Rebuild a key from its stored parts.
    pub fn new(instance_id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            instance_id,
            created_at,
        }
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.instance_id)
    }
}

/// Lifecycle status of a process.
///
/// `Finished`, `Failed`, `Cancelled` and `TimedOut` are terminal and
/// immutable once reached. All conditional transitions go through the
/// queue store's compare-and-swap so concurrent updates race safely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    /// Queue row created, payload not yet resolved.
    New,
    /// Fully resolved and durably staged, waiting for a runner.
    Enqueued,
    /// Claimed by a runner, not yet executing.
    Starting,
    /// Actively executing.
    Running,
    /// Resume in flight after a suspend.
    Resuming,
    /// Waiting for an external event or child processes.
    Suspended,
    /// Completed successfully.
    Finished,
    /// Completed with an error.
    Failed,
    /// Cancelled by a user, a policy or an exclusive-group conflict.
    Cancelled,
    /// Exceeded its execution timeout.
    TimedOut,
}

impl ProcessStatus {
    /// All statuses that count as "still occupying the queue".
    pub const NON_TERMINAL: [ProcessStatus; 6] = [
        ProcessStatus::New,
        ProcessStatus::Enqueued,
        ProcessStatus::Starting,
        ProcessStatus::Running,
        ProcessStatus::Resuming,
        ProcessStatus::Suspended,
    ];

    /// Whether this status is terminal (immutable once reached).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessStatus::Finished
                | ProcessStatus::Failed
                | ProcessStatus::Cancelled
                | ProcessStatus::TimedOut
        )
    }

    /// The stored string form of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::New => "NEW",
            ProcessStatus::Enqueued => "ENQUEUED",
            ProcessStatus::Starting => "STARTING",
            ProcessStatus::Running => "RUNNING",
            ProcessStatus::Resuming => "RESUMING",
            ProcessStatus::Suspended => "SUSPENDED",
            ProcessStatus::Finished => "FINISHED",
            ProcessStatus::Failed => "FAILED",
            ProcessStatus::Cancelled => "CANCELLED",
            ProcessStatus::TimedOut => "TIMED_OUT",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(ProcessStatus::New),
            "ENQUEUED" => Ok(ProcessStatus::Enqueued),
            "STARTING" => Ok(ProcessStatus::Starting),
            "RUNNING" => Ok(ProcessStatus::Running),
            "RESUMING" => Ok(ProcessStatus::Resuming),
            "SUSPENDED" => Ok(ProcessStatus::Suspended),
            "FINISHED" => Ok(ProcessStatus::Finished),
            "FAILED" => Ok(ProcessStatus::Failed),
            "CANCELLED" => Ok(ProcessStatus::Cancelled),
            "TIMED_OUT" => Ok(ProcessStatus::TimedOut),
            other => Err(format!("unknown process status: '{}'", other)),
        }
    }
}

/// The kind of a process, recorded on its queue entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessKind {
    /// A regular process.
    #[default]
    Default,
    /// A handler process spawned when its parent fails.
    FailureHandler,
    /// A handler process spawned when its parent is cancelled.
    CancelHandler,
}

impl ProcessKind {
    /// The stored string form of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Default => "DEFAULT",
            ProcessKind::FailureHandler => "FAILURE_HANDLER",
            ProcessKind::CancelHandler => "CANCEL_HANDLER",
        }
    }
}

impl FromStr for ProcessKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEFAULT" => Ok(ProcessKind::Default),
            "FAILURE_HANDLER" => Ok(ProcessKind::FailureHandler),
            "CANCEL_HANDLER" => Ok(ProcessKind::CancelHandler),
            other => Err(format!("unknown process kind: '{}'", other)),
        }
    }
}

/// Repository provenance of a process, recorded on its queue entry once
/// the repository snapshot is resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    /// The repository id, if the process was started from a registered repo.
    pub repo_id: Option<Uuid>,
    /// The repository URL.
    pub repo_url: Option<String>,
    /// Path inside the repository the process definition was read from.
    pub repo_path: Option<String>,
    /// The resolved commit id.
    pub commit_id: Option<String>,
    /// The resolved branch or tag.
    pub commit_branch: Option<String>,
}
