//! The durable, transactional process queue.
//!
//! This module defines the store abstraction and backend implementations.
//! Queue entries are the single source of truth for process state; rows
//! are created before any expensive work and never deleted.

pub mod manager;
pub mod postgres;
pub mod sqlite;

pub use self::manager::ProcessQueueManager;
pub use self::postgres::PostgresQueueStore;
pub use self::sqlite::SqliteQueueStore;

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::process::{ProcessKey, ProcessKind, ProcessStatus, RepositoryInfo};

/// Fields persisted when a process is first recorded (status NEW).
#[derive(Debug, Clone)]
pub struct QueueEntryInsert {
    /// The process identity.
    pub key: ProcessKey,
    /// The kind of process.
    pub kind: ProcessKind,
    /// The parent process for forks and handlers.
    pub parent_instance_id: Option<Uuid>,
    /// The owning organization.
    pub organization_id: Option<Uuid>,
    /// The owning project.
    pub project_id: Option<Uuid>,
    /// Who started the process.
    pub initiator: Option<String>,
    /// Free-form tags.
    pub tags: Vec<String>,
}

/// The persisted projection of a process.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// The process instance id.
    pub instance_id: Uuid,
    /// When the process was created.
    pub created_at: DateTime<Utc>,
    /// The kind of process.
    pub kind: ProcessKind,
    /// Current lifecycle status.
    pub status: ProcessStatus,
    /// The parent process, if any.
    pub parent_instance_id: Option<Uuid>,
    /// The owning organization.
    pub organization_id: Option<Uuid>,
    /// The owning project.
    pub project_id: Option<Uuid>,
    /// Who started the process.
    pub initiator: Option<String>,
    /// Mutual-exclusion group tag, if claimed.
    pub exclusive_group: Option<String>,
    /// Repository provenance.
    pub repository: RepositoryInfo,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Recorded failure message, if the process failed.
    pub error: Option<String>,
    /// When the row was last updated.
    pub last_updated_at: DateTime<Utc>,
}

impl QueueEntry {
    /// The process key of this entry.
    pub fn key(&self) -> ProcessKey {
        ProcessKey::new(self.instance_id, self.created_at)
    }
}

/// One status transition in the audit trail.
#[derive(Debug, Clone)]
pub struct StatusHistoryEntry {
    /// The process instance id.
    pub instance_id: Uuid,
    /// The status that was entered.
    pub status: ProcessStatus,
    /// When the transition happened.
    pub changed_at: DateTime<Utc>,
}

/// Scope of an aggregate count query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountScope {
    /// All processes on the server.
    All,
    /// Processes of one organization.
    Org(Uuid),
    /// Processes of one project.
    Project(Uuid),
}

/// Store interface for the process queue.
///
/// All conditional transitions are compare-and-swap against the stored
/// current status; a transition that does not match performs nothing.
/// Status history rows are written in the same transaction as the
/// transition they record.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Create the initial NEW row for a process.
    ///
    /// Must be called exactly once per process key; a duplicate insert
    /// fails with [`OrchestratorError::AlreadyExists`].
    async fn insert_initial(&self, entry: &QueueEntryInsert) -> Result<()>;

    /// Fetch a queue entry.
    async fn get(&self, instance_id: Uuid) -> Result<Option<QueueEntry>>;

    /// Fetch just the current status of a process.
    async fn get_status(&self, instance_id: Uuid) -> Result<Option<ProcessStatus>>;

    /// Unconditional status transition.
    async fn update_status(&self, instance_id: Uuid, status: ProcessStatus) -> Result<()>;

    /// Compare-and-swap status transition.
    ///
    /// Returns `false` (and performs nothing) when the current status does
    /// not equal `expected`.
    async fn update_expected_status(
        &self,
        instance_id: Uuid,
        expected: ProcessStatus,
        next: ProcessStatus,
    ) -> Result<bool>;

    /// Record a failure message on the entry.
    async fn record_error(&self, instance_id: Uuid, message: &str) -> Result<()>;

    /// Record repository provenance on the entry.
    async fn update_repository_info(
        &self,
        instance_id: Uuid,
        info: &RepositoryInfo,
    ) -> Result<()>;

    /// Number of ancestors of the given process, following parent links.
    ///
    /// A process with no parent has depth 0. Computed by a recursive
    /// query, never materialized.
    async fn ancestor_depth(&self, instance_id: Uuid) -> Result<i64>;

    /// Count of entries whose current status is in `statuses`, at the
    /// given scope. `excluding` omits one instance from the count (the
    /// submission being admitted).
    async fn count_in_statuses(
        &self,
        scope: CountScope,
        statuses: &[ProcessStatus],
        excluding: Option<Uuid>,
    ) -> Result<i64>;

    /// Per-status entry counts at the given scope.
    async fn status_counts(&self, scope: CountScope) -> Result<BTreeMap<String, i64>>;

    /// Atomically decide whether this process may hold the exclusive
    /// group.
    ///
    /// Under one short-lived serializing transaction: if another
    /// non-terminal entry exists for `(project_id, group)`, the current
    /// process is transitioned to CANCELLED and `false` is returned;
    /// otherwise the group tag is recorded on the entry and `true` is
    /// returned.
    async fn exclusive_claim(
        &self,
        instance_id: Uuid,
        project_id: Uuid,
        group: &str,
    ) -> Result<bool>;

    /// Persist (or replace) the wait condition for a process.
    async fn set_wait_condition(
        &self,
        instance_id: Uuid,
        condition: &serde_json::Value,
    ) -> Result<()>;

    /// Atomically remove and return the wait condition for a process.
    ///
    /// At most one caller observes the condition; concurrent takes see
    /// `None`.
    async fn take_wait_condition(&self, instance_id: Uuid) -> Result<Option<serde_json::Value>>;

    /// All currently open wait conditions.
    async fn list_wait_conditions(&self) -> Result<Vec<(Uuid, serde_json::Value)>>;

    /// Direct children of a process, oldest first.
    async fn children_of(&self, parent_instance_id: Uuid) -> Result<Vec<QueueEntry>>;

    /// Current statuses of the given processes; unknown ids map to `None`.
    async fn find_statuses(
        &self,
        instance_ids: &[Uuid],
    ) -> Result<BTreeMap<Uuid, Option<ProcessStatus>>> {
        let mut out = BTreeMap::new();
        for id in instance_ids {
            out.insert(*id, self.get_status(*id).await?);
        }
        Ok(out)
    }

    /// The recorded status transitions of a process, oldest first.
    async fn status_history(&self, instance_id: Uuid) -> Result<Vec<StatusHistoryEntry>>;

    /// Whether the backing store is reachable.
    async fn health_check(&self) -> Result<bool>;
}

// ----------------------------------------------------------------------------
// Row conversion helpers shared by the backends
// ----------------------------------------------------------------------------

/// Raw queue row as stored; ids and statuses are strings in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct RawQueueEntry {
    pub instance_id: String,
    pub created_at: DateTime<Utc>,
    pub kind: String,
    pub current_status: String,
    pub parent_instance_id: Option<String>,
    pub organization_id: Option<String>,
    pub project_id: Option<String>,
    pub initiator: Option<String>,
    pub exclusive_group: Option<String>,
    pub repo_id: Option<String>,
    pub repo_url: Option<String>,
    pub repo_path: Option<String>,
    pub commit_id: Option<String>,
    pub commit_branch: Option<String>,
    pub tags: Option<serde_json::Value>,
    pub error: Option<String>,
    pub last_updated_at: DateTime<Utc>,
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| OrchestratorError::DatabaseError {
        operation: "decode".to_string(),
        details: format!("invalid uuid '{}': {}", raw, e),
    })
}

pub(crate) fn parse_status(raw: &str) -> Result<ProcessStatus> {
    ProcessStatus::from_str(raw).map_err(|e| OrchestratorError::DatabaseError {
        operation: "decode".to_string(),
        details: e,
    })
}

impl TryFrom<RawQueueEntry> for QueueEntry {
    type Error = OrchestratorError;

    fn try_from(row: RawQueueEntry) -> Result<QueueEntry> {
        let tags = match row.tags {
            Some(v) => serde_json::from_value(v)?,
            None => Vec::new(),
        };

        Ok(QueueEntry {
            instance_id: parse_uuid(&row.instance_id)?,
            created_at: row.created_at,
            kind: ProcessKind::from_str(&row.kind).map_err(|e| {
                OrchestratorError::DatabaseError {
                    operation: "decode".to_string(),
                    details: e,
                }
            })?,
            status: parse_status(&row.current_status)?,
            parent_instance_id: row.parent_instance_id.as_deref().map(parse_uuid).transpose()?,
            organization_id: row.organization_id.as_deref().map(parse_uuid).transpose()?,
            project_id: row.project_id.as_deref().map(parse_uuid).transpose()?,
            initiator: row.initiator,
            exclusive_group: row.exclusive_group,
            repository: RepositoryInfo {
                repo_id: row.repo_id.as_deref().map(parse_uuid).transpose()?,
                repo_url: row.repo_url,
                repo_path: row.repo_path,
                commit_id: row.commit_id,
                commit_branch: row.commit_branch,
            },
            tags,
            error: row.error,
            last_updated_at: row.last_updated_at,
        })
    }
}

/// SQL fragment listing the non-terminal statuses, for IN clauses.
pub(crate) const NON_TERMINAL_SQL: &str =
    "'NEW', 'ENQUEUED', 'STARTING', 'RUNNING', 'RESUMING', 'SUSPENDED'";

/// Columns selected for [`RawQueueEntry`].
pub(crate) const ENTRY_COLUMNS: &str = "instance_id, created_at, kind, current_status, \
     parent_instance_id, organization_id, project_id, initiator, exclusive_group, \
     repo_id, repo_url, repo_path, commit_id, commit_branch, tags, error, last_updated_at";
