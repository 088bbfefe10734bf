//! Shared-coordination-store job backend.
//!
//! Jobs serialize as `job:<id>` values; terminal records carry a TTL
//! (default 24 h) so the store self-cleans. A `jobs:list` sorted set
//! keyed by creation time supports listing and cleanup. Read-modify-
//! write transitions hold a local writer lock: job mutations are
//! single-writer by ownership (the manager or the owning cluster
//! node), the lock only guards against races inside this process.

use crate::coord::{CoordStore, Score};
use crate::error::{Result, StoreError};
use crate::job_store::{apply_status, StoreStats};
use chrono::{DateTime, Utc};
use riposte_protocol::defaults::{INTERRUPTED_MESSAGE, TERMINAL_JOB_TTL_SECS};
use riposte_protocol::{Job, JobId, JobStatus};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

const LIST_SET: &str = "jobs:list";

/// Canonical key for a job record in the shared store.
pub fn job_key(id: &JobId) -> String {
    format!("job:{}", id)
}

pub struct SharedStore {
    coord: Arc<dyn CoordStore>,
    write_lock: Mutex<()>,
}

impl SharedStore {
    pub fn new(coord: Arc<dyn CoordStore>) -> Self {
        Self {
            coord,
            write_lock: Mutex::new(()),
        }
    }

    pub fn coord(&self) -> &Arc<dyn CoordStore> {
        &self.coord
    }

    fn write_job(&self, job: &Job) -> Result<()> {
        let key = job_key(&job.id);
        let body = serde_json::to_string(job)?;
        if job.is_terminal() {
            self.coord
                .set_with_ttl(&key, &body, Duration::from_secs(TERMINAL_JOB_TTL_SECS));
        } else {
            self.coord.set(&key, &body);
        }
        self.coord.zadd(
            LIST_SET,
            job.id.as_str(),
            Score::new(job.created_at.timestamp_millis(), 0),
        );
        Ok(())
    }

    fn read_job(&self, id: &JobId) -> Result<Option<Job>> {
        match self.coord.get(&job_key(id)) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn mutate(&self, id: &JobId, f: impl FnOnce(&mut Job)) -> Result<Job> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut job = self
            .read_job(id)?
            .ok_or_else(|| StoreError::not_found(id.to_string()))?;
        f(&mut job);
        self.write_job(&job)?;
        Ok(job)
    }

    pub fn save(&self, job: &Job) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.write_job(job)
    }

    pub fn load(&self, id: &JobId) -> Result<Option<Job>> {
        self.read_job(id)
    }

    pub fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        // Newest first by creation-time score
        let members = self.coord.zrange(LIST_SET, usize::MAX, true);
        let mut jobs = Vec::new();
        for (member, _) in members {
            let id = JobId::from(member);
            let Some(job) = self.read_job(&id)? else {
                // TTL-expired record; drop the dangling list entry
                self.coord.zrem(LIST_SET, id.as_str());
                continue;
            };
            if status.map(|s| job.status == s).unwrap_or(true) {
                jobs.push(job);
                if jobs.len() >= limit {
                    break;
                }
            }
        }
        Ok(jobs)
    }

    pub fn update_status(&self, id: &JobId, status: JobStatus) -> Result<()> {
        self.mutate(id, |job| apply_status(job, status)).map(|_| ())
    }

    pub fn update_results(&self, id: &JobId, results: Vec<Value>, error: &str) -> Result<()> {
        self.mutate(id, |job| {
            job.results = results;
            if !error.is_empty() && !job.is_terminal() {
                job.mark_failed(error);
            } else if !error.is_empty() {
                job.error = error.to_string();
            }
        })
        .map(|_| ())
    }

    pub fn update_context(&self, id: &JobId, ctx: &Map<String, Value>) -> Result<()> {
        self.mutate(id, |job| job.context = ctx.clone()).map(|_| ())
    }

    pub fn claim(&self, id: &JobId, node: &str) -> Result<Option<Job>> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let Some(mut job) = self.read_job(id)? else {
            return Ok(None);
        };
        if job.status != JobStatus::Pending {
            return Ok(None);
        }
        job.mark_running(node);
        self.write_job(&job)?;
        Ok(Some(job))
    }

    pub fn cancel_pending(&self, id: &JobId) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let Some(mut job) = self.read_job(id)? else {
            return Ok(false);
        };
        if job.status != JobStatus::Pending {
            return Ok(false);
        }
        job.mark_cancelled();
        self.write_job(&job)?;
        Ok(true)
    }

    pub fn delete(&self, id: &JobId) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.coord.del(&job_key(id));
        self.coord.zrem(LIST_SET, id.as_str());
        Ok(())
    }

    pub fn stats(&self, duration_window: usize) -> Result<StoreStats> {
        let jobs = self.list(None, usize::MAX)?;
        Ok(StoreStats::from_jobs(jobs.iter(), duration_window))
    }

    pub fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let jobs = self.list(None, usize::MAX)?;
        let mut removed = 0;
        for job in jobs {
            if job.is_terminal() && job.completed_at.unwrap_or(job.created_at) < cutoff {
                self.delete(&job.id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn recover(&self) -> Result<Vec<Job>> {
        let running = self.list(Some(JobStatus::Running), usize::MAX)?;
        let mut recovered = Vec::with_capacity(running.len());
        for job in running {
            recovered.push(self.mutate(&job.id, |job| job.mark_failed(INTERRUPTED_MESSAGE))?);
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered interrupted jobs");
        }
        Ok(recovered)
    }
}
