//! SQLite-backed durable job store.
//!
//! Rows live in a `job_queue` table keyed by job id, with RFC 3339
//! timestamps and JSON payloads stored as TEXT. Check cursors live in a
//! companion `check_runs` table. The schema is created on open, so a fresh
//! profile directory works without a separate migration step.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

use crate::store::{CheckpointStore, JobStore, JobStoreError};
use crate::types::{JobId, JobRecord};

/// SQLite-backed job store. Cheap to clone; safe to share across tasks.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (creating if missing) the store at `path`.
    pub async fn open(path: &Path) -> Result<Self, JobStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                JobStoreError::Storage(format!(
                    "failed to create job store directory {parent:?}: {e}"
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|e| JobStoreError::Storage(format!("failed to open {path:?}: {e}")))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open the store under the OS app-data directory
    /// (`{data_dir}/courier/jobs.db`).
    pub async fn open_default() -> Result<Self, JobStoreError> {
        Self::open(&default_db_path()?).await
    }

    /// In-memory database, for tests and ephemeral queues.
    ///
    /// Pinned to a single connection: every pooled connection to
    /// `sqlite::memory:` would otherwise get its own private database.
    pub async fn open_in_memory() -> Result<Self, JobStoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| JobStoreError::Storage(format!("failed to open in-memory db: {e}")))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_queue (
                id          TEXT PRIMARY KEY,
                queue_type  TEXT NOT NULL,
                timestamp   TEXT NOT NULL,
                payload     TEXT NOT NULL,
                attempts    INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| JobStoreError::Storage(format!("failed to create job_queue table: {e}")))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_job_queue_type
                ON job_queue (queue_type, timestamp)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| JobStoreError::Storage(format!("failed to create job_queue index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS check_runs (
                storage_key  TEXT PRIMARY KEY,
                last_run_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| JobStoreError::Storage(format!("failed to create check_runs table: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue_type), err)]
    async fn insert(&self, job: &JobRecord) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_queue (id, queue_type, timestamp, payload, attempts)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.queue_type)
        .bind(job.timestamp.to_rfc3339())
        .bind(job.payload.to_string())
        .bind(i64::from(job.attempts))
        .execute(&self.pool)
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db) if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) => {
                JobStoreError::AlreadyExists(job.id)
            }
            _ => JobStoreError::Storage(format!("failed to insert job: {e}")),
        })?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_all_for_queue(
        &self,
        queue_type: &str,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, queue_type, timestamp, payload, attempts
            FROM job_queue
            WHERE queue_type = ?1
            ORDER BY timestamp ASC
            "#,
        )
        .bind(queue_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| JobStoreError::Storage(format!("failed to load jobs: {e}")))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    async fn delete(&self, id: JobId) -> Result<(), JobStoreError> {
        sqlx::query("DELETE FROM job_queue WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| JobStoreError::Storage(format!("failed to delete job: {e}")))?;
        Ok(())
    }

    async fn record_attempt(&self, id: JobId, attempts: u32) -> Result<(), JobStoreError> {
        let result = sqlx::query("UPDATE job_queue SET attempts = ?2 WHERE id = ?1")
            .bind(id.to_string())
            .bind(i64::from(attempts))
            .execute(&self.pool)
            .await
            .map_err(|e| JobStoreError::Storage(format!("failed to update attempts: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteJobStore {
    async fn load_checkpoint(
        &self,
        key: &str,
    ) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        let row = sqlx::query("SELECT last_run_at FROM check_runs WHERE storage_key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| JobStoreError::Storage(format!("failed to load checkpoint: {e}")))?;

        match row {
            Some(row) => {
                let raw: String = row
                    .try_get("last_run_at")
                    .map_err(|e| JobStoreError::Storage(format!("bad check_runs row: {e}")))?;
                let at = DateTime::parse_from_rfc3339(&raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| {
                        JobStoreError::Storage(format!("invalid check_runs.last_run_at: {e}"))
                    })?;
                Ok(Some(at))
            }
            None => Ok(None),
        }
    }

    async fn save_checkpoint(&self, key: &str, at: DateTime<Utc>) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO check_runs (storage_key, last_run_at)
            VALUES (?1, ?2)
            ON CONFLICT (storage_key) DO UPDATE SET last_run_at = excluded.last_run_at
            "#,
        )
        .bind(key)
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| JobStoreError::Storage(format!("failed to save checkpoint: {e}")))?;
        Ok(())
    }
}

/// Map a database row into a `JobRecord`.
fn row_to_record(row: &SqliteRow) -> Result<JobRecord, JobStoreError> {
    let bad = |what: &str, e: &dyn std::fmt::Display| {
        JobStoreError::Storage(format!("invalid job_queue.{what}: {e}"))
    };

    let id_str: String = row.try_get("id").map_err(|e| bad("id", &e))?;
    let id = Uuid::parse_str(&id_str)
        .map(JobId::from_uuid)
        .map_err(|e| bad("id", &e))?;

    let queue_type: String = row.try_get("queue_type").map_err(|e| bad("queue_type", &e))?;

    let ts_str: String = row.try_get("timestamp").map_err(|e| bad("timestamp", &e))?;
    let timestamp = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| bad("timestamp", &e))?;

    let payload_str: String = row.try_get("payload").map_err(|e| bad("payload", &e))?;
    let payload = serde_json::from_str(&payload_str).map_err(|e| bad("payload", &e))?;

    let attempts: i64 = row.try_get("attempts").map_err(|e| bad("attempts", &e))?;

    Ok(JobRecord {
        id,
        queue_type,
        timestamp,
        payload,
        attempts: attempts.max(0) as u32,
    })
}

/// Resolve the job database path under the OS app-data directory.
fn default_db_path() -> Result<PathBuf, JobStoreError> {
    let base = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut home| {
                home.push(".local");
                home.push("share");
                home
            })
        })
        .ok_or_else(|| {
            JobStoreError::Storage("failed to resolve OS app data directory".to_string())
        })?;

    let mut path = base;
    path.push("courier");
    path.push("jobs.db");
    Ok(path)
}
