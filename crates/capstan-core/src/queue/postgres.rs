//! PostgreSQL-backed queue store.
//!
//! The production backend. The exclusive-group claim serializes through a
//! transaction-scoped advisory lock on a fixed key for the whole
//! exclusive-group namespace; the lock is released with the transaction.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::process::{ProcessStatus, RepositoryInfo};

use super::{
    CountScope, ENTRY_COLUMNS, NON_TERMINAL_SQL, QueueEntry, QueueEntryInsert, QueueStore,
    RawQueueEntry, StatusHistoryEntry, parse_status,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgres");

/// Advisory-lock key serializing exclusive-group claims.
const EXCLUSIVE_GROUP_LOCK_KEY: i64 = 8_213_904_529_870_051;

/// PostgreSQL-backed queue store.
#[derive(Clone)]
pub struct PostgresQueueStore {
    pool: PgPool,
}

impl PostgresQueueStore {
    /// Create a store from an existing pool. Migrations must already have
    /// been applied.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the given database URL and run all migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| OrchestratorError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("failed to connect to PostgreSQL: {}", e),
            })?;

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
        conn: &mut PgConnection,
        instance_id: &str,
        status: ProcessStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO process_status_history (instance_id, status, changed_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(instance_id)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(conn)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    async fn insert_initial(&self, entry: &QueueEntryInsert) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO process_queue
                (instance_id, created_at, kind, current_status, parent_instance_id,
                 organization_id, project_id, initiator, tags, last_updated_at)
            VALUES ($1, $2, $3, 'NEW', $4, $5, $6, $7, $8, $9)
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
            "SELECT {} FROM process_queue WHERE instance_id = $1",
            ENTRY_COLUMNS
        ))
        .bind(instance_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(QueueEntry::try_from).transpose()
    }

    async fn get_status(&self, instance_id: Uuid) -> Result<Option<ProcessStatus>> {
        let raw: Option<(String,)> =
            sqlx::query_as("SELECT current_status FROM process_queue WHERE instance_id = $1")
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
            SET current_status = $2, last_updated_at = $3
            WHERE instance_id = $1
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
            SET current_status = $3, last_updated_at = $4
            WHERE instance_id = $1 AND current_status = $2
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
            SET error = $2, last_updated_at = $3
            WHERE instance_id = $1
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
            SET repo_id = $2, repo_url = $3, repo_path = $4,
                commit_id = $5, commit_branch = $6, last_updated_at = $7
            WHERE instance_id = $1
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
                WHERE instance_id = $1
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

        let mut next_param = statuses.len() + 1;
        let placeholders: Vec<String> = (1..=statuses.len()).map(|i| format!("${}", i)).collect();
        let mut sql = format!(
            "SELECT COUNT(*) FROM process_queue WHERE current_status IN ({})",
            placeholders.join(", ")
        );
        match scope {
            CountScope::All => {}
            CountScope::Org(_) => {
                sql.push_str(&format!(" AND organization_id = ${}", next_param));
                next_param += 1;
            }
            CountScope::Project(_) => {
                sql.push_str(&format!(" AND project_id = ${}", next_param));
                next_param += 1;
            }
        }
        if excluding.is_some() {
            sql.push_str(&format!(" AND instance_id <> ${}", next_param));
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
        let mut sql = "SELECT current_status, COUNT(*) FROM process_queue".to_string();
        match scope {
            CountScope::All => {}
            CountScope::Org(_) => sql.push_str(" WHERE organization_id = $1"),
            CountScope::Project(_) => sql.push_str(" WHERE project_id = $1"),
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
        let mut tx = self.pool.begin().await?;

        // Held until commit/rollback; only the existence check and the
        // decision run under it.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(EXCLUSIVE_GROUP_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let other: Option<(i32,)> = sqlx::query_as(&format!(
            r#"
            SELECT 1 FROM process_queue
            WHERE project_id = $1
              AND exclusive_group = $2
              AND instance_id <> $3
              AND current_status IN ({})
            LIMIT 1
            "#,
            NON_TERMINAL_SQL
        ))
        .bind(project_id.to_string())
        .bind(group)
        .bind(instance_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        if other.is_some() {
            sqlx::query(
                r#"
                UPDATE process_queue
                SET current_status = 'CANCELLED', last_updated_at = $2
                WHERE instance_id = $1
                "#,
            )
            .bind(instance_id.to_string())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

            Self::insert_history(&mut *tx, &instance_id.to_string(), ProcessStatus::Cancelled)
                .await?;
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE process_queue
            SET exclusive_group = $2, last_updated_at = $3
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id.to_string())
        .bind(group)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn set_wait_condition(
        &self,
        instance_id: Uuid,
        condition: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO process_wait_conditions (instance_id, condition, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (instance_id) DO UPDATE SET condition = EXCLUDED.condition
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
            "DELETE FROM process_wait_conditions WHERE instance_id = $1 RETURNING condition",
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
            "SELECT {} FROM process_queue WHERE parent_instance_id = $1 ORDER BY created_at ASC",
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
            WHERE instance_id = $1
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
