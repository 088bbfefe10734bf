//! The unified job store.
//!
//! One struct over three backends (file, sqlite, shared coordination
//! store), all satisfying the same contract and the same conformance
//! suite. Callers pick a backend at startup; everything after that is
//! backend-agnostic.

use crate::coord::CoordStore;
use crate::error::{Result, StoreError};
use crate::file::FileStore;
use crate::shared::SharedStore;
use crate::sqlite::SqliteStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use riposte_protocol::defaults::STATS_DURATION_WINDOW;
use riposte_protocol::{Job, JobId, JobStatus};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Write attempts before a transient failure surfaces as
/// `StoreUnavailable`.
const WRITE_ATTEMPTS: u32 = 3;
const WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Transient failures are worth retrying; logical ones are not.
fn is_transient(error: &StoreError) -> bool {
    matches!(
        error,
        StoreError::Io(_) | StoreError::Sqlx(_) | StoreError::Unavailable(_)
    )
}

/// Retry a write with exponential backoff; a transient error that
/// survives every attempt surfaces as `StoreUnavailable`.
async fn with_write_retry<T, Fut>(label: &str, mut op: impl FnMut() -> Fut) -> Result<T>
where
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = WRITE_RETRY_BACKOFF;
    for attempt in 1..=WRITE_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < WRITE_ATTEMPTS && is_transient(&e) => {
                warn!(attempt, "{} failed transiently: {}", label, e);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) if is_transient(&e) => return Err(StoreError::unavailable(e.to_string())),
            Err(e) => return Err(e),
        }
    }
    unreachable!("retry loop always returns")
}

/// Apply a status transition to a job, maintaining the timestamp
/// invariants: `started_at` set when leaving pending, `completed_at`
/// set exactly for terminal states.
pub fn apply_status(job: &mut Job, status: JobStatus) {
    job.status = status;
    match status {
        JobStatus::Running => {
            job.started_at.get_or_insert_with(Utc::now);
        }
        JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
            job.completed_at = Some(Utc::now());
        }
        JobStatus::Pending => {
            job.completed_at = None;
        }
    }
}

/// Counts per status plus the average duration of recently completed
/// jobs.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
    /// Average of the last N completed jobs' durations, seconds.
    pub avg_duration_secs: Option<f64>,
}

impl StoreStats {
    pub fn from_jobs<'a>(jobs: impl Iterator<Item = &'a Job>, window: usize) -> Self {
        let mut stats = StoreStats::default();
        let mut completed: Vec<&Job> = Vec::new();

        for job in jobs {
            stats.total += 1;
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => {
                    stats.completed += 1;
                    completed.push(job);
                }
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }

        completed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        let durations: Vec<f64> = completed
            .iter()
            .take(window)
            .filter_map(|job| job.duration())
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .collect();
        if !durations.is_empty() {
            stats.avg_duration_secs =
                Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        stats
    }
}

/// Durable job records with atomic lifecycle updates.
pub enum JobStore {
    File(FileStore),
    Sqlite(SqliteStore),
    Shared(SharedStore),
}

impl JobStore {
    /// File-backed store: one JSON document, atomic rename on write.
    pub fn open_file(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::File(FileStore::open(path)?))
    }

    /// Embedded relational store.
    pub async fn open_sqlite(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::Sqlite(SqliteStore::open(path).await?))
    }

    /// In-memory sqlite, for tests and ephemeral runs.
    pub async fn open_sqlite_in_memory() -> Result<Self> {
        Ok(Self::Sqlite(SqliteStore::open_in_memory().await?))
    }

    /// Backend over the shared coordination store, used in cluster mode.
    pub fn open_shared(coord: Arc<dyn CoordStore>) -> Self {
        Self::Shared(SharedStore::new(coord))
    }

    /// Upsert by id. After return, a crash must not lose the write.
    /// Transient backend failures are retried with backoff.
    pub async fn save(&self, job: &Job) -> Result<()> {
        with_write_retry("save", || async move {
            match self {
                Self::File(store) => store.save(job),
                Self::Sqlite(store) => store.save(job).await,
                Self::Shared(store) => store.save(job),
            }
        })
        .await
    }

    pub async fn load(&self, id: &JobId) -> Result<Option<Job>> {
        match self {
            Self::File(store) => store.load(id),
            Self::Sqlite(store) => store.load(id).await,
            Self::Shared(store) => store.load(id),
        }
    }

    /// Newest-first by creation time.
    pub async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        match self {
            Self::File(store) => store.list(status, limit),
            Self::Sqlite(store) => store.list(status, limit).await,
            Self::Shared(store) => store.list(status, limit),
        }
    }

    /// Update status plus the timestamps it implies.
    pub async fn update_status(&self, id: &JobId, status: JobStatus) -> Result<()> {
        with_write_retry("update_status", || async move {
            match self {
                Self::File(store) => store.update_status(id, status),
                Self::Sqlite(store) => store.update_status(id, status).await,
                Self::Shared(store) => store.update_status(id, status),
            }
        })
        .await
    }

    /// Replace results; a non-empty error fails the job unless already
    /// terminal.
    pub async fn update_results(&self, id: &JobId, results: Vec<Value>, error: &str) -> Result<()> {
        let results = &results;
        with_write_retry("update_results", || async move {
            match self {
                Self::File(store) => store.update_results(id, results.clone(), error),
                Self::Sqlite(store) => store.update_results(id, results.clone(), error).await,
                Self::Shared(store) => store.update_results(id, results.clone(), error),
            }
        })
        .await
    }

    /// Replace the stored context (final context post-execution).
    pub async fn update_context(&self, id: &JobId, ctx: &Map<String, Value>) -> Result<()> {
        with_write_retry("update_context", || async move {
            match self {
                Self::File(store) => store.update_context(id, ctx),
                Self::Sqlite(store) => store.update_context(id, ctx).await,
                Self::Shared(store) => store.update_context(id, ctx),
            }
        })
        .await
    }

    /// Atomic pending -> running; `None` when another worker won or the
    /// job is gone.
    pub async fn claim(&self, id: &JobId, node: &str) -> Result<Option<Job>> {
        match self {
            Self::File(store) => store.claim(id, node),
            Self::Sqlite(store) => store.claim(id, node).await,
            Self::Shared(store) => store.claim(id, node),
        }
    }

    /// Atomic pending -> cancelled.
    pub async fn cancel_pending(&self, id: &JobId) -> Result<bool> {
        match self {
            Self::File(store) => store.cancel_pending(id),
            Self::Sqlite(store) => store.cancel_pending(id).await,
            Self::Shared(store) => store.cancel_pending(id),
        }
    }

    /// Idempotent delete.
    pub async fn delete(&self, id: &JobId) -> Result<()> {
        match self {
            Self::File(store) => store.delete(id),
            Self::Sqlite(store) => store.delete(id).await,
            Self::Shared(store) => store.delete(id),
        }
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        match self {
            Self::File(store) => store.stats(STATS_DURATION_WINDOW),
            Self::Sqlite(store) => store.stats(STATS_DURATION_WINDOW).await,
            Self::Shared(store) => store.stats(STATS_DURATION_WINDOW),
        }
    }

    /// Remove terminal jobs older than the given age.
    pub async fn cleanup_older_than(&self, age: ChronoDuration) -> Result<usize> {
        let cutoff = Utc::now() - age;
        self.cleanup_before(cutoff).await
    }

    pub async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        match self {
            Self::File(store) => store.cleanup_older_than(cutoff),
            Self::Sqlite(store) => store.cleanup_older_than(cutoff).await,
            Self::Shared(store) => store.cleanup_older_than(cutoff),
        }
    }

    /// Timestamped snapshot. `None` for backends whose durability is
    /// delegated (in-memory sqlite, the shared store).
    pub async fn backup(&self) -> Result<Option<PathBuf>> {
        match self {
            Self::File(store) => store.backup().map(Some),
            Self::Sqlite(store) => store.backup().await,
            Self::Shared(_) => Ok(None),
        }
    }

    /// Startup recovery: fail every `running` job with the interrupted
    /// message. Called exactly once; returns the recovered jobs so the
    /// caller can emit job-failed events.
    pub async fn recover(&self) -> Result<Vec<Job>> {
        match self {
            Self::File(store) => store.recover(),
            Self::Sqlite(store) => store.recover().await,
            Self::Shared(store) => store.recover(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_status_invariants() {
        let mut job = Job::new(Vec::new(), Map::new());

        apply_status(&mut job, JobStatus::Running);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_none());

        apply_status(&mut job, JobStatus::Completed);
        assert!(job.completed_at.is_some());

        apply_status(&mut job, JobStatus::Pending);
        assert!(job.completed_at.is_none());
        // started_at is never cleared once set
        assert!(job.started_at.is_some());
    }

    #[test]
    fn test_stats_average_window() {
        let mut jobs = Vec::new();
        for i in 0..4 {
            let mut job = Job::new(Vec::new(), Map::new());
            let start = Utc::now() - ChronoDuration::seconds(100);
            job.started_at = Some(start);
            job.completed_at = Some(start + ChronoDuration::seconds(i + 1));
            job.status = JobStatus::Completed;
            jobs.push(job);
        }

        let stats = StoreStats::from_jobs(jobs.iter(), 2);
        assert_eq!(stats.completed, 4);
        // Window of 2 takes the most recently completed (4s and 3s)
        assert_eq!(stats.avg_duration_secs, Some(3.5));
    }
}
