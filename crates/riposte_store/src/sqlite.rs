//! Sqlite-backed job store.
//!
//! One `jobs` table with an indexed status column; playbook, context,
//! results, and tags are JSON text columns. Claim-like transitions run
//! as `UPDATE ... WHERE status = ?` so concurrent claimers cannot both
//! win.

use crate::error::{Result, StoreError};
use crate::job_store::StoreStats;
use chrono::{DateTime, Utc};
use riposte_protocol::defaults::INTERRUPTED_MESSAGE;
use riposte_protocol::{Job, JobId, JobStatus};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::path::{Path, PathBuf};
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id            TEXT PRIMARY KEY,
    status        TEXT NOT NULL,
    playbook      TEXT NOT NULL,
    context       TEXT NOT NULL,
    results       TEXT NOT NULL DEFAULT '[]',
    error         TEXT NOT NULL DEFAULT '',
    created_at    TEXT NOT NULL,
    started_at    TEXT,
    completed_at  TEXT,
    assigned_node TEXT,
    retry_count   INTEGER NOT NULL DEFAULT 0,
    priority      INTEGER NOT NULL DEFAULT 0,
    tags          TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at);
"#;

pub struct SqliteStore {
    pool: Pool<Sqlite>,
    /// None for in-memory stores.
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open a database file, creating it (and the schema) if needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new().connect(&url).await?;
        let store = Self {
            pool,
            path: Some(path),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// In-memory database, used by tests and ephemeral deployments.
    /// Pinned to one connection so every query sees the same memory.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool, path: None };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn save(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, status, playbook, context, results, error, created_at,
                 started_at, completed_at, assigned_node, retry_count, priority, tags)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                playbook = excluded.playbook,
                context = excluded.context,
                results = excluded.results,
                error = excluded.error,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                assigned_node = excluded.assigned_node,
                retry_count = excluded.retry_count,
                priority = excluded.priority,
                tags = excluded.tags
            "#,
        )
        .bind(job.id.as_str())
        .bind(job.status.as_str())
        .bind(serde_json::to_string(&job.playbook)?)
        .bind(serde_json::to_string(&job.context)?)
        .bind(serde_json::to_string(&job.results)?)
        .bind(&job.error)
        .bind(job.created_at.to_rfc3339())
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .bind(&job.assigned_node)
        .bind(job.retry_count as i64)
        .bind(job.priority)
        .bind(serde_json::to_string(&job.tags)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load(&self, id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_job(&r)).transpose()
    }

    pub async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let limit = limit.min(i64::MAX as usize) as i64;
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM jobs WHERE status = ?
                     ORDER BY created_at DESC, id ASC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC, id ASC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_job).collect()
    }

    pub async fn update_status(&self, id: &JobId, status: JobStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let query = match status {
            JobStatus::Running => {
                sqlx::query(
                    "UPDATE jobs SET status = ?, started_at = COALESCE(started_at, ?) WHERE id = ?",
                )
                .bind(status.as_str())
                .bind(&now)
                .bind(id.as_str())
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                sqlx::query("UPDATE jobs SET status = ?, completed_at = ? WHERE id = ?")
                    .bind(status.as_str())
                    .bind(&now)
                    .bind(id.as_str())
            }
            JobStatus::Pending => {
                sqlx::query("UPDATE jobs SET status = ?, completed_at = NULL WHERE id = ?")
                    .bind(status.as_str())
                    .bind(id.as_str())
            }
        };
        let affected = query.execute(&self.pool).await?.rows_affected();
        if affected == 0 {
            return Err(StoreError::not_found(id.to_string()));
        }
        Ok(())
    }

    pub async fn update_results(&self, id: &JobId, results: Vec<Value>, error: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(status) = status else {
            return Err(StoreError::not_found(id.to_string()));
        };
        let current: JobStatus = status
            .parse()
            .map_err(|e: String| StoreError::unavailable(e))?;

        if !error.is_empty() && !current.is_terminal() {
            sqlx::query(
                "UPDATE jobs SET results = ?, error = ?, status = 'failed', completed_at = ?
                 WHERE id = ?",
            )
            .bind(serde_json::to_string(&results)?)
            .bind(error)
            .bind(Utc::now().to_rfc3339())
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query("UPDATE jobs SET results = ?, error = ? WHERE id = ?")
                .bind(serde_json::to_string(&results)?)
                .bind(error)
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn update_context(&self, id: &JobId, ctx: &Map<String, Value>) -> Result<()> {
        let affected = sqlx::query("UPDATE jobs SET context = ? WHERE id = ?")
            .bind(serde_json::to_string(ctx)?)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(StoreError::not_found(id.to_string()));
        }
        Ok(())
    }

    /// Atomic claim: only one caller can move a job out of pending.
    pub async fn claim(&self, id: &JobId, node: &str) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;
        let affected = sqlx::query(
            "UPDATE jobs
             SET status = 'running',
                 started_at = COALESCE(started_at, ?),
                 assigned_node = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(node)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            tx.commit().await?;
            return Ok(None);
        }

        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(row_to_job(&row)?))
    }

    /// Atomic pending -> cancelled transition.
    pub async fn cancel_pending(&self, id: &JobId) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', completed_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    pub async fn delete(&self, id: &JobId) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn stats(&self, duration_window: usize) -> Result<StoreStats> {
        let jobs = self.list(None, usize::MAX).await?;
        Ok(StoreStats::from_jobs(jobs.iter(), duration_window))
    }

    pub async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let affected = sqlx::query(
            "DELETE FROM jobs
             WHERE status IN ('completed', 'failed', 'cancelled')
               AND COALESCE(completed_at, created_at) < ?",
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected as usize)
    }

    /// Snapshot via `VACUUM INTO` a timestamped sibling. In-memory
    /// stores have nothing durable to snapshot.
    pub async fn backup(&self) -> Result<Option<PathBuf>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let dest = riposte_protocol::paths::backup_path(path, Utc::now());
        let statement = format!("VACUUM INTO '{}'", dest.display());
        sqlx::query(&statement).execute(&self.pool).await?;
        info!(backup = %dest.display(), "job store backed up");
        Ok(Some(dest))
    }

    pub async fn recover(&self) -> Result<Vec<Job>> {
        let running = self.list(Some(JobStatus::Running), usize::MAX).await?;
        if running.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE jobs SET status = 'failed', error = ?, completed_at = ?
             WHERE status = 'running'",
        )
        .bind(INTERRUPTED_MESSAGE)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        info!(count = running.len(), "recovered interrupted jobs");

        let mut recovered = Vec::with_capacity(running.len());
        for job in running {
            if let Some(job) = self.load(&job.id).await? {
                recovered.push(job);
            }
        }
        Ok(recovered)
    }
}

fn row_to_job(row: &SqliteRow) -> Result<Job> {
    let status: String = row.get("status");
    let playbook: String = row.get("playbook");
    let context: String = row.get("context");
    let results: String = row.get("results");
    let tags: String = row.get("tags");

    Ok(Job {
        id: JobId::from(row.get::<String, _>("id")),
        status: status
            .parse()
            .map_err(|e: String| StoreError::unavailable(e))?,
        playbook: serde_json::from_str(&playbook)?,
        context: serde_json::from_str(&context)?,
        results: serde_json::from_str(&results)?,
        error: row.get("error"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        started_at: row
            .get::<Option<String>, _>("started_at")
            .as_deref()
            .map(parse_timestamp)
            .transpose()?,
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .as_deref()
            .map(parse_timestamp)
            .transpose()?,
        assigned_node: row.get("assigned_node"),
        retry_count: row.get::<i64, _>("retry_count") as u32,
        priority: row.get("priority"),
        tags: serde_json::from_str(&tags)?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::unavailable(format!("invalid timestamp '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let mut job = Job::new(vec![serde_json::json!({"run": "hello"})], Map::new());
        job.priority = 7;
        job.tags = vec!["phishing".to_string()];

        store.save(&job).await.unwrap();
        let loaded = store.load(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.priority, 7);
        assert_eq!(loaded.tags, vec!["phishing".to_string()]);
        assert_eq!(loaded.playbook, job.playbook);
    }

    #[tokio::test]
    async fn test_claim_is_single_winner() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let job = Job::new(Vec::new(), Map::new());
        store.save(&job).await.unwrap();

        assert!(store.claim(&job.id, "n1").await.unwrap().is_some());
        assert!(store.claim(&job.id, "n2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_fails_running_jobs() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let mut job = Job::new(Vec::new(), Map::new());
        job.mark_running("n1");
        store.save(&job).await.unwrap();

        let recovered = store.recover().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, JobStatus::Failed);
        assert_eq!(recovered[0].error, INTERRUPTED_MESSAGE);
    }

    #[tokio::test]
    async fn test_backup_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("jobs.db")).await.unwrap();
        store.save(&Job::new(Vec::new(), Map::new())).await.unwrap();

        let backup = store.backup().await.unwrap().unwrap();
        assert!(backup.exists());
    }
}
