//! File-backed job store.
//!
//! Jobs live in one JSON document. Every mutation rewrites a temporary
//! sibling and atomically renames it over the store file, so a crash
//! mid-write leaves the previous generation intact. A single writer
//! lock guards the in-memory map and the file together.

use crate::error::{Result, StoreError};
use crate::job_store::{apply_status, StoreStats};
use chrono::{DateTime, Utc};
use riposte_protocol::defaults::INTERRUPTED_MESSAGE;
use riposte_protocol::{paths, Job, JobId, JobStatus};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

pub struct FileStore {
    path: PathBuf,
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl FileStore {
    /// Open (or create) the store file and load every job into memory.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let jobs = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let list: Vec<Job> = if raw.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&raw)?
            };
            info!(count = list.len(), path = %path.display(), "loaded job store");
            list.into_iter().map(|job| (job.id.clone(), job)).collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            jobs: Mutex::new(jobs),
        })
    }

    /// Serialize the full map to a temp sibling, then rename into place.
    fn persist(&self, jobs: &HashMap<JobId, Job>) -> Result<()> {
        let mut list: Vec<&Job> = jobs.values().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(&list)?;
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn with_jobs<T>(&self, f: impl FnOnce(&mut HashMap<JobId, Job>) -> T) -> T {
        let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut jobs)
    }

    pub fn save(&self, job: &Job) -> Result<()> {
        self.with_jobs(|jobs| {
            jobs.insert(job.id.clone(), job.clone());
            self.persist(jobs)
        })
    }

    pub fn load(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.with_jobs(|jobs| jobs.get(id).cloned()))
    }

    pub fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        Ok(self.with_jobs(|jobs| {
            let mut matched: Vec<Job> = jobs
                .values()
                .filter(|job| status.map(|s| job.status == s).unwrap_or(true))
                .cloned()
                .collect();
            matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
            matched.truncate(limit);
            matched
        }))
    }

    fn mutate(&self, id: &JobId, f: impl FnOnce(&mut Job)) -> Result<()> {
        self.with_jobs(|jobs| {
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| StoreError::not_found(id.to_string()))?;
            f(job);
            self.persist(jobs)
        })
    }

    pub fn update_status(&self, id: &JobId, status: JobStatus) -> Result<()> {
        self.mutate(id, |job| apply_status(job, status))
    }

    pub fn update_results(
        &self,
        id: &JobId,
        results: Vec<serde_json::Value>,
        error: &str,
    ) -> Result<()> {
        self.mutate(id, |job| {
            job.results = results;
            if !error.is_empty() && !job.is_terminal() {
                job.mark_failed(error);
            } else if !error.is_empty() {
                job.error = error.to_string();
            }
        })
    }

    pub fn update_context(&self, id: &JobId, ctx: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        self.mutate(id, |job| job.context = ctx.clone())
    }

    /// Atomic pending -> running transition; `None` when the job is no
    /// longer claimable.
    pub fn claim(&self, id: &JobId, node: &str) -> Result<Option<Job>> {
        self.with_jobs(|jobs| {
            let Some(job) = jobs.get_mut(id) else {
                return Ok(None);
            };
            if job.status != JobStatus::Pending {
                return Ok(None);
            }
            job.mark_running(node);
            let claimed = job.clone();
            self.persist(jobs)?;
            Ok(Some(claimed))
        })
    }

    /// Atomic pending -> cancelled transition.
    pub fn cancel_pending(&self, id: &JobId) -> Result<bool> {
        self.with_jobs(|jobs| {
            let Some(job) = jobs.get_mut(id) else {
                return Ok(false);
            };
            if job.status != JobStatus::Pending {
                return Ok(false);
            }
            job.mark_cancelled();
            self.persist(jobs)?;
            Ok(true)
        })
    }

    pub fn delete(&self, id: &JobId) -> Result<()> {
        self.with_jobs(|jobs| {
            if jobs.remove(id).is_some() {
                self.persist(jobs)?;
            }
            Ok(())
        })
    }

    pub fn stats(&self, duration_window: usize) -> Result<StoreStats> {
        Ok(self.with_jobs(|jobs| StoreStats::from_jobs(jobs.values(), duration_window)))
    }

    pub fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_jobs(|jobs| {
            let before = jobs.len();
            jobs.retain(|_, job| {
                !(job.is_terminal() && job.completed_at.unwrap_or(job.created_at) < cutoff)
            });
            let removed = before - jobs.len();
            if removed > 0 {
                debug!(removed, "cleaned up terminal jobs");
                self.persist(jobs)?;
            }
            Ok(removed)
        })
    }

    /// Copy the store file to a timestamped sibling.
    pub fn backup(&self) -> Result<PathBuf> {
        self.with_jobs(|jobs| {
            // Make sure the on-disk generation is current before copying
            self.persist(jobs)?;
            let dest = paths::backup_path(&self.path, Utc::now());
            std::fs::copy(&self.path, &dest)?;
            info!(backup = %dest.display(), "job store backed up");
            Ok(dest)
        })
    }

    /// Startup recovery: every `running` job becomes `failed` with the
    /// interrupted message. Returns the recovered jobs so the caller
    /// can emit events.
    pub fn recover(&self) -> Result<Vec<Job>> {
        self.with_jobs(|jobs| {
            let mut recovered = Vec::new();
            for job in jobs.values_mut() {
                if job.status == JobStatus::Running {
                    job.mark_failed(INTERRUPTED_MESSAGE);
                    recovered.push(job.clone());
                }
            }
            if !recovered.is_empty() {
                info!(count = recovered.len(), "recovered interrupted jobs");
                self.persist(jobs)?;
            }
            Ok(recovered)
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
