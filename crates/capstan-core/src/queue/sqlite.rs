//! SQLite-backed queue store.
//!
//! The embedded backend, also used by the test suite. SQLite has a single
//! writer, so the exclusive-group claim serializes through a
//! `BEGIN IMMEDIATE` transaction instead of an advisory lock.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::process::{ProcessStatus, RepositoryInfo};

use super::{
    CountScope, ENTRY_COLUMNS, NON_TERMINAL_SQL, QueueEntry, QueueEntryInsert, QueueStore,
    RawQueueEntry, StatusHistoryEntry, parse_status,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed queue store.
#[derive(Clone)]
pub struct SqliteQueueStore {
    pool: SqlitePool,
}

impl SqliteQueueStore {
    /// Create a store from an existing pool. Migrations must already have
    /// been applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a database file path.
    ///
    /// Creates parent directories and the database file as needed, then
    /// runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| OrchestratorError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| OrchestratorError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        Self::from_pool_with_migrations(pool).await
    }

    /// Create an in-memory store, for embedding and tests.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| OrchestratorError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("failed to create in-memory SQLite pool: {}", e),
            })?;

        Self::from_pool_with_migrations(pool).await
    }

    async fn from_pool_with_migrations(pool: SqlitePool) -> Result<Self> {
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| OrchestratorError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    async fn insert_history(
        conn: &mut SqliteConnection,
        instance_id: &str,
        status: ProcessStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO process_status_history (instance_id, status, changed_at)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(instance_id)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(conn)
        .await?;

        Ok(())
    }

    async fn exclusive_claim_in_tx(
        conn: &mut SqliteConnection,
        instance_id: &str,
        project_id: &str,
        group: &str,
    ) -> Result<bool> {
        let other: Option<(i64,)> = sqlx::query_as(&format!(
            r#"
            SELECT 1 FROM process_queue
            WHERE project_id = ?1
              AND exclusive_group = ?2
              AND instance_id <> ?3
              AND current_status IN ({})
            LIMIT 1
            "#,
            NON_TERMINAL_SQL
        ))
        .bind(project_id)
        .bind(group)
        .bind(instance_id)
        .fetch_optional(&mut *conn)
        .await?;

        if other.is_some() {
            sqlx::query(
                r#"
                UPDATE process_queue
                SET current_status = 'CANCELLED', last_updated_at = ?2
                WHERE instance_id = ?1
                "#,
            )
            .bind(instance_id)
            .bind(Utc::now())
            .execute(&mut *conn)
            .await?;

            Self::insert_history(conn, instance_id, ProcessStatus::Cancelled).await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE process_queue
            SET exclusive_group = ?2, last_updated_at = ?3
            WHERE instance_id = ?1
            "#,
        )
        .bind(instance_id)
        .bind(group)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        Ok(true)
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn insert_initial(&self, entry: &QueueEntryInsert) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO process_queue
                (instance_id, created_at, kind, current_status, parent_instance_id,
                 organization_id, project_id, initiator, tags, last_updated_at)
            VALUES (?1, ?2, ?3, 'NEW', ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(entry.key.instance_id.to_string())
        .bind(entry.key.created_at)
        .bind(entry.kind.as_str())
        .bind(entry.parent_instance_id.map(|id| id.to_string()))
        .bind(entry.organization_id.map(|id| id.to_string()))
        .bind(entry.project_id.map(|id| id.to_string()))
        .bind(entry.initiator.as_deref())
        .bind(serde_json::to_value(&entry.tags)?)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await;

        if let Err(sqlx::Error::Database(db)) = &result
            && db.is_unique_violation()
        {
            return Err(OrchestratorError::AlreadyExists {
                instance_id: entry.key.instance_id,
            });
        }
        result?;

        Self::insert_history(
            &mut *tx,
            &entry.key.instance_id.to_string(),
            ProcessStatus::New,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, instance_id: Uuid) -> Result<Option<QueueEntry>> {
        let row = sqlx::query_as::<_, RawQueueEntry>(&format!(
            "SELECT {} FROM process_queue WHERE instance_id = ?1",
            ENTRY_COLUMNS
        ))
        .bind(instance_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(QueueEntry::try_from).transpose()
    }

    async fn get_status(&self, instance_id: Uuid) -> Result<Option<ProcessStatus>> {
        let raw: Option<(String,)> =
            sqlx::query_as("SELECT current_status FROM process_queue WHERE instance_id = ?1")
                .bind(instance_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        raw.map(|(s,)| parse_status(&s)).transpose()
    }

    async fn update_status(&self, instance_id: Uuid, status: ProcessStatus) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE process_queue
            SET current_status = ?2, last_updated_at = ?3
            WHERE instance_id = ?1
            "#,
        )
        .bind(instance_id.to_string())
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(OrchestratorError::ProcessNotFound { instance_id });
        }

        Self::insert_history(&mut *tx, &instance_id.to_string(), status).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_expected_status(
        &self,
        instance_id: Uuid,
        expected: ProcessStatus,
        next: ProcessStatus,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE process_queue
            SET current_status = ?3, last_updated_at = ?4
            WHERE instance_id = ?1 AND current_status = ?2
            "#,
        )
        .bind(instance_id.to_string())
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(false);
        }

        Self::insert_history(&mut *tx, &instance_id.to_string(), next).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn record_error(&self, instance_id: Uuid, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE process_queue
            SET error = ?2, last_updated_at = ?3
            WHERE instance_id = ?1
            "#,
        )
        .bind(instance_id.to_string())
        .bind(message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_repository_info(
        &self,
        instance_id: Uuid,
        info: &RepositoryInfo,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE process_queue
            SET repo_id = ?2, repo_url = ?3, repo_path = ?4,
                commit_id = ?5, commit_branch = ?6, last_updated_at = ?7
            WHERE instance_id = ?1
            "#,
        )
        .bind(instance_id.to_string())
        .bind(info.repo_id.map(|id| id.to_string()))
        .bind(info.repo_url.as_deref())
        .bind(info.repo_path.as_deref())
        .bind(info.commit_id.as_deref())
        .bind(info.commit_branch.as_deref())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn ancestor_depth(&self, instance_id: Uuid) -> Result<i64> {
        let depth: Option<(Option<i64>,)> = sqlx::query_as(
            r#"
            WITH RECURSIVE parents (instance_id, parent_instance_id, depth) AS (
                SELECT instance_id, parent_instance_id, 0
                FROM process_queue
                WHERE instance_id = ?1
                UNION ALL
                SELECT q.instance_id, q.parent_instance_id, p.depth + 1
                FROM process_queue q
                JOIN parents p ON q.instance_id = p.parent_instance_id
            )
            SELECT MAX(depth) FROM parents
            "#,
        )
        .bind(instance_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(depth.and_then(|(d,)| d).unwrap_or(0))
    }

    async fn count_in_statuses(
        &self,
        scope: CountScope,
        statuses: &[ProcessStatus],
        excluding: Option<Uuid>,
    ) -> Result<i64> {
        if statuses.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let mut sql = format!(
            "SELECT COUNT(*) FROM process_queue WHERE current_status IN ({})",
            placeholders
        );
        match scope {
            CountScope::All => {}
            CountScope::Org(_) => sql.push_str(" AND organization_id = ?"),
            CountScope::Project(_) => sql.push_str(" AND project_id = ?"),
        }
        if excluding.is_some() {
            sql.push_str(" AND instance_id <> ?");
        }

        let mut query = sqlx::query_as::<_, (i64,)>(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        match scope {
            CountScope::All => {}
            CountScope::Org(id) | CountScope::Project(id) => {
                query = query.bind(id.to_string());
            }
        }
        if let Some(id) = excluding {
            query = query.bind(id.to_string());
        }

        let (count,) = query.fetch_one(&self.pool).await?;
        Ok(count)
    }

    async fn status_counts(&self, scope: CountScope) -> Result<BTreeMap<String, i64>> {
        let mut sql =
            "SELECT current_status, COUNT(*) FROM process_queue".to_string();
        match scope {
            CountScope::All => {}
            CountScope::Org(_) => sql.push_str(" WHERE organization_id = ?"),
            CountScope::Project(_) => sql.push_str(" WHERE project_id = ?"),
        }
        sql.push_str(" GROUP BY current_status");

        let mut query = sqlx::query_as::<_, (String, i64)>(&sql);
        match scope {
            CountScope::All => {}
            CountScope::Org(id) | CountScope::Project(id) => {
                query = query.bind(id.to_string());
            }
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().collect())
    }

    async fn exclusive_claim(
        &self,
        instance_id: Uuid,
        project_id: Uuid,
        group: &str,
    ) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;

        // BEGIN IMMEDIATE takes the write lock up front so the
        // existence-check-and-decide is atomic against concurrent claims.
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let claimed = Self::exclusive_claim_in_tx(
            &mut *conn,
            &instance_id.to_string(),
            &project_id.to_string(),
            group,
        )
        .await;

        match claimed {
            Ok(claimed) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(claimed)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn set_wait_condition(
        &self,
        instance_id: Uuid,
        condition: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO process_wait_conditions (instance_id, condition, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (instance_id) DO UPDATE SET condition = excluded.condition
            "#,
        )
        .bind(instance_id.to_string())
        .bind(condition)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn take_wait_condition(&self, instance_id: Uuid) -> Result<Option<serde_json::Value>> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "DELETE FROM process_wait_conditions WHERE instance_id = ?1 RETURNING condition",
        )
        .bind(instance_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(c,)| c))
    }

    async fn list_wait_conditions(&self) -> Result<Vec<(Uuid, serde_json::Value)>> {
        let rows: Vec<(String, serde_json::Value)> =
            sqlx::query_as("SELECT instance_id, condition FROM process_wait_conditions")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(id, c)| Ok((super::parse_uuid(&id)?, c)))
            .collect()
    }

    async fn children_of(&self, parent_instance_id: Uuid) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query_as::<_, RawQueueEntry>(&format!(
            "SELECT {} FROM process_queue WHERE parent_instance_id = ?1 ORDER BY created_at ASC",
            ENTRY_COLUMNS
        ))
        .bind(parent_instance_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueueEntry::try_from).collect()
    }

    async fn status_history(&self, instance_id: Uuid) -> Result<Vec<StatusHistoryEntry>> {
        let rows: Vec<(String, chrono::DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT status, changed_at FROM process_status_history
            WHERE instance_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(status, changed_at)| {
                Ok(StatusHistoryEntry {
                    instance_id,
                    status: parse_status(&status)?,
                    changed_at,
                })
            })
            .collect()
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}
