//! The job manager: worker pool, submission, background tickers.
//!
//! Submission always persists the job first; dispatch is bounded, so
//! when every worker is busy the job simply stays pending and a sweep
//! ticker re-offers it once a slot frees. Each worker claims its job
//! with an atomic pending -> running transition, evaluates on the
//! blocking pool, and writes results, final context, and status back
//! through the store.

use crate::error::{Result, ServerError};
use crate::executor::{evaluate_on_blocking_pool, EngineDeps};
use crate::webhook::Notifier;
use chrono::Duration as ChronoDuration;
use riposte_protocol::defaults::{CANNOT_CANCEL_RUNNING_MESSAGE, CLEANUP_RETENTION_DAYS};
use riposte_protocol::{Event, EventKind, Job, JobId, JobStatus};
use riposte_store::{JobStore, StoreStats};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

/// Manager tuning (plain data).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub workers: usize,
    pub node_name: String,
    pub cleanup_interval: Duration,
    pub backup_interval: Duration,
    pub dispatch_sweep_interval: Duration,
    pub retention_days: i64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workers: riposte_protocol::defaults::DEFAULT_WORKER_POOL_SIZE,
            node_name: "local".to_string(),
            cleanup_interval: Duration::from_secs(
                riposte_protocol::defaults::CLEANUP_INTERVAL_SECS,
            ),
            backup_interval: Duration::from_secs(riposte_protocol::defaults::BACKUP_INTERVAL_SECS),
            dispatch_sweep_interval: Duration::from_secs(2),
            retention_days: CLEANUP_RETENTION_DAYS,
        }
    }
}

pub struct JobManager {
    store: Arc<JobStore>,
    deps: Arc<EngineDeps>,
    notifier: Arc<Notifier>,
    config: ManagerConfig,
    dispatch_tx: mpsc::Sender<JobId>,
}

impl JobManager {
    /// Build the manager and spawn its dispatcher; tickers start
    /// separately via [`JobManager::spawn_tickers`].
    pub fn start(
        store: Arc<JobStore>,
        deps: Arc<EngineDeps>,
        notifier: Arc<Notifier>,
        config: ManagerConfig,
    ) -> Arc<Self> {
        let workers = config.workers.max(1);
        let (tx, rx) = mpsc::channel::<JobId>(workers * 2);

        let manager = Arc::new(Self {
            store,
            deps,
            notifier,
            config,
            dispatch_tx: tx,
        });

        manager.clone().spawn_dispatcher(rx, workers);
        manager
    }

    fn spawn_dispatcher(self: Arc<Self>, mut rx: mpsc::Receiver<JobId>, workers: usize) {
        tokio::spawn(async move {
            let slots = Arc::new(Semaphore::new(workers));
            info!(workers, "worker pool started");
            while let Some(id) = rx.recv().await {
                let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                    break;
                };
                let manager = Arc::clone(&self);
                tokio::spawn(async move {
                    manager.execute(id).await;
                    drop(permit);
                });
            }
            debug!("dispatcher stopped");
        });
    }

    /// Startup recovery: fail interrupted jobs and emit their events.
    /// Call once, before accepting submissions.
    pub async fn recover(&self) -> Result<usize> {
        let recovered = self.store.recover().await?;
        for job in &recovered {
            self.notifier
                .emit(Event::for_job(EventKind::JobFailed, job.id.clone()));
        }
        Ok(recovered.len())
    }

    /// Validate, persist, and dispatch a new job.
    pub async fn submit(
        &self,
        playbook: Vec<Value>,
        context: Map<String, Value>,
        priority: i64,
        tags: Vec<String>,
    ) -> Result<JobId> {
        // Reject malformed playbooks before anything is persisted
        riposte_engine::parse_playbook(&playbook)?;

        let job = Job::new(playbook, context)
            .with_priority(priority)
            .with_tags(tags);
        let id = job.id.clone();
        self.store.save(&job).await?;
        self.notifier
            .emit(Event::for_job(EventKind::JobSubmitted, id.clone()));

        self.offer(id.clone());
        Ok(id)
    }

    /// Non-blocking dispatch: a full channel leaves the job pending for
    /// the next sweep.
    fn offer(&self, id: JobId) {
        if self.dispatch_tx.try_send(id.clone()).is_err() {
            debug!(job = %id, "workers busy, job stays pending");
        }
    }

    async fn execute(&self, id: JobId) {
        // Atomic claim; a lost race (cancelled, already claimed by a
        // sweep) is not an error
        let claimed = match self.store.claim(&id, &self.config.node_name).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                error!(job = %id, "claim failed: {}", e);
                return;
            }
        };
        self.notifier
            .emit(Event::for_job(EventKind::JobStarted, id.clone()));
        info!(job = %id, "job started");

        match evaluate_on_blocking_pool(Arc::clone(&self.deps), claimed).await {
            Ok((results, context)) => {
                let write = async {
                    self.store.update_results(&id, results, "").await?;
                    self.store.update_context(&id, &context).await?;
                    self.store.update_status(&id, JobStatus::Completed).await
                };
                match write.await {
                    Ok(()) => {
                        self.notifier
                            .emit(Event::for_job(EventKind::JobCompleted, id.clone()));
                        info!(job = %id, "job completed");
                    }
                    Err(e) => error!(job = %id, "failed to record completion: {}", e),
                }
            }
            Err(message) => {
                warn!(job = %id, "job failed: {}", message);
                if let Err(e) = self.store.update_results(&id, Vec::new(), &message).await {
                    error!(job = %id, "failed to record failure: {}", e);
                }
                self.notifier
                    .emit(Event::for_job(EventKind::JobFailed, id.clone()));
            }
        }
    }

    /// Cancellation: atomic for pending jobs; running jobs return the
    /// policy message.
    pub async fn cancel(&self, id: &JobId) -> Result<(bool, String)> {
        if self.store.cancel_pending(id).await? {
            self.notifier
                .emit(Event::for_job(EventKind::JobCancelled, id.clone()));
            return Ok((true, "job cancelled".to_string()));
        }
        match self.store.load(id).await? {
            Some(job) if job.status == JobStatus::Running => {
                Ok((false, CANNOT_CANCEL_RUNNING_MESSAGE.to_string()))
            }
            Some(job) => Ok((false, format!("job is already {}", job.status))),
            None => Err(ServerError::JobNotFound(id.to_string())),
        }
    }

    pub async fn poll(&self, id: &JobId) -> Result<Job> {
        self.store
            .load(id)
            .await?
            .ok_or_else(|| ServerError::JobNotFound(id.to_string()))
    }

    pub async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        Ok(self.store.list(status, limit).await?)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        Ok(self.store.stats().await?)
    }

    /// Background tickers: pending-dispatch sweep, cleanup, backup.
    pub fn spawn_tickers(self: &Arc<Self>) {
        let sweep = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep.config.dispatch_sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sweep.sweep_pending().await;
            }
        });

        let cleanup = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup.config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so startup is quiet
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match cleanup
                    .store
                    .cleanup_older_than(ChronoDuration::days(cleanup.config.retention_days))
                    .await
                {
                    Ok(removed) if removed > 0 => info!(removed, "cleanup pass removed jobs"),
                    Ok(_) => {}
                    Err(e) => warn!("cleanup pass failed: {}", e),
                }
            }
        });

        let backup = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(backup.config.backup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match backup.store.backup().await {
                    Ok(Some(path)) => info!(path = %path.display(), "backup written"),
                    Ok(None) => {}
                    Err(e) => warn!("backup failed: {}", e),
                }
            }
        });
    }

    /// Re-offer pending jobs to free workers, oldest first.
    async fn sweep_pending(&self) {
        let pending = match self
            .store
            .list(Some(JobStatus::Pending), self.config.workers * 4)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("pending sweep failed: {}", e);
                return;
            }
        };
        for job in pending.into_iter().rev() {
            self.offer(job.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::deps_with_scripts;
    use crate::webhook::testing::RecordingTransport;
    use crate::webhook::{WebhookSink, WebhookTransport};
    use riposte_protocol::defaults::INTERRUPTED_MESSAGE;
    use serde_json::json;
    use std::collections::HashMap;

    async fn wait_for_terminal(manager: &JobManager, id: &JobId) -> Job {
        for _ in 0..300 {
            let job = manager.poll(id).await.unwrap();
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached a terminal state");
    }

    async fn manager_with_scripts(
        pairs: &[(&str, Value)],
        workers: usize,
    ) -> (Arc<JobManager>, Arc<RecordingTransport>) {
        let store = Arc::new(JobStore::open_sqlite_in_memory().await.unwrap());
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Notifier::new(transport.clone() as Arc<dyn WebhookTransport>);
        notifier.register(WebhookSink {
            url: "http://sink".to_string(),
            headers: HashMap::new(),
            kinds: vec![],
        });
        let manager = JobManager::start(
            store,
            deps_with_scripts(pairs),
            notifier,
            ManagerConfig {
                workers,
                dispatch_sweep_interval: Duration::from_millis(50),
                ..ManagerConfig::default()
            },
        );
        (manager, transport)
    }

    #[tokio::test]
    async fn test_basic_run_scenario() {
        let (manager, _) =
            manager_with_scripts(&[("hello", json!({"greeting": "world"}))], 2).await;

        let id = manager
            .submit(
                vec![json!({"run": "hello", "name": "world"})],
                Map::new(),
                0,
                vec![],
            )
            .await
            .unwrap();

        let job = wait_for_terminal(&manager, &id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(
            job.results,
            vec![json!({"script": "hello", "status": "completed"})]
        );
        assert_eq!(job.context.get("greeting"), Some(&json!("world")));
        assert!(job.error.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_playbook_rejected_at_submission() {
        let (manager, _) = manager_with_scripts(&[], 1).await;
        let result = manager
            .submit(vec![json!({"frobnicate": 1})], Map::new(), 0, vec![])
            .await;
        assert!(matches!(result, Err(ServerError::Validation(_))));
        assert_eq!(manager.list(None, 10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_failed_script_fails_job_with_rule_index() {
        let (manager, _) = manager_with_scripts(&[("ok", json!({}))], 1).await;
        let id = manager
            .submit(
                vec![json!({"run": "ok"}), json!({"run": "missing"})],
                Map::new(),
                0,
                vec![],
            )
            .await
            .unwrap();

        let job = wait_for_terminal(&manager, &id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.contains("rule 1"), "{}", job.error);
    }

    #[tokio::test]
    async fn test_panic_recovered_as_failed_job() {
        let (manager, _) = manager_with_scripts(&[], 1).await;
        let id = manager
            .submit(vec![json!({"run": "panic"})], Map::new(), 0, vec![])
            .await
            .unwrap();

        let job = wait_for_terminal(&manager, &id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.contains("panic"), "{}", job.error);
    }

    #[tokio::test]
    async fn test_bounded_pool_eventually_drains_backlog() {
        let (manager, _) = manager_with_scripts(&[("hello", json!({}))], 2).await;
        manager.spawn_tickers();

        let mut ids = Vec::new();
        for _ in 0..10 {
            ids.push(
                manager
                    .submit(vec![json!({"run": "hello"})], Map::new(), 0, vec![])
                    .await
                    .unwrap(),
            );
        }

        for id in &ids {
            let job = wait_for_terminal(&manager, id).await;
            assert_eq!(job.status, JobStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_cancel_pending_vs_terminal() {
        // No workers pull: use a manager whose dispatcher is saturated
        // by a single slot busy with a slow claim; simplest is to
        // submit to a store directly and cancel before dispatch
        let (manager, _) = manager_with_scripts(&[("hello", json!({}))], 1).await;

        let id = manager
            .submit(vec![json!({"run": "hello"})], Map::new(), 0, vec![])
            .await
            .unwrap();
        // Either we win the race against the worker (cancelled) or the
        // job completes; both terminal outcomes are valid, but the API
        // must answer coherently
        let (ok, message) = manager.cancel(&id).await.unwrap();
        if !ok {
            assert!(
                message.contains("already") || message.contains("interrupted") || message.contains("running"),
                "{message}"
            );
        }

        let job = wait_for_terminal(&manager, &id).await;
        assert!(matches!(
            job.status,
            JobStatus::Cancelled | JobStatus::Completed
        ));
    }

    #[tokio::test]
    async fn test_crash_recovery_emits_job_failed() {
        let store = Arc::new(JobStore::open_sqlite_in_memory().await.unwrap());

        // Persist a job that was mid-flight when the server died
        let mut job = Job::new(vec![json!({"run": "hello"})], Map::new());
        job.mark_running("local");
        store.save(&job).await.unwrap();

        let transport = Arc::new(RecordingTransport::default());
        let notifier = Notifier::new(transport.clone() as Arc<dyn WebhookTransport>);
        notifier.register(WebhookSink {
            url: "http://sink".to_string(),
            headers: HashMap::new(),
            kinds: vec![riposte_protocol::EventKind::JobFailed],
        });

        let manager = JobManager::start(
            store,
            deps_with_scripts(&[]),
            notifier,
            ManagerConfig::default(),
        );
        let recovered = manager.recover().await.unwrap();
        assert_eq!(recovered, 1);

        let job = manager.poll(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error, INTERRUPTED_MESSAGE);

        let posts = crate::webhook::testing::wait_for_posts(&transport, 1);
        assert_eq!(posts.len(), 1);
        let event: Event = serde_json::from_slice(&posts[0].1).unwrap();
        assert_eq!(event.kind, EventKind::JobFailed);
    }

    #[tokio::test]
    async fn test_stats_after_mixed_outcomes() {
        let (manager, _) = manager_with_scripts(&[("hello", json!({}))], 2).await;

        let ok = manager
            .submit(vec![json!({"run": "hello"})], Map::new(), 0, vec![])
            .await
            .unwrap();
        let bad = manager
            .submit(vec![json!({"run": "missing"})], Map::new(), 0, vec![])
            .await
            .unwrap();
        wait_for_terminal(&manager, &ok).await;
        wait_for_terminal(&manager, &bad).await;

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total, 2);
    }
}
