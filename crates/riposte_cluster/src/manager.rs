//! The cluster manager.
//!
//! When cluster mode is on, this layer owns job dispatch: submissions
//! land in the shared priority queue, nodes pull work cooperatively
//! (lowest load first), claims are marked with TTL'd keys, and a
//! janitor — runnable on any node — requeues work whose claim expired,
//! evicts silent nodes, and enforces per-job timeouts. Failures retry
//! with exponential delay until the budget is spent, then park in the
//! dead-letter queue.

use crate::error::Result;
use crate::keys::claim_key;
use crate::queue::ClusterQueue;
use crate::registry::NodeRegistry;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use riposte_protocol::defaults::{RETRY_DELAY_BASE_SECS, RETRY_DELAY_CAP_SECS};
use riposte_protocol::{Job, JobId, JobStatus, NodeInfo};
use riposte_store::{CoordStore, SharedStore};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cluster configuration (plain data).
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub cluster: String,
    pub node_id: String,
    pub host: String,
    pub port: u16,
    /// Local worker slots; load = in-flight / capacity.
    pub capacity: usize,
    pub heartbeat_interval: Duration,
    pub job_timeout: Duration,
    pub max_retries: u32,
    pub claim_ttl: Duration,
}

/// What happened to a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Re-enqueued for another attempt.
    Retried { attempt: u32, ready_at: DateTime<Utc> },
    /// Budget exhausted; parked in the DLQ.
    DeadLettered,
}

/// Outcome of one janitor pass.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Delayed retries that became claimable.
    pub pumped: usize,
    /// Nodes newly marked inactive this pass.
    pub nodes_lost: Vec<String>,
    /// Jobs requeued after their claim expired.
    pub requeued: Vec<JobId>,
    /// Jobs that exhausted their retry budget this pass.
    pub dead_lettered: Vec<JobId>,
    /// Locally owned jobs failed for exceeding the job timeout.
    pub timed_out: Vec<JobId>,
}

/// Snapshot for the cluster-info surface.
#[derive(Debug, serde::Serialize)]
pub struct ClusterInfo {
    pub nodes: Vec<NodeInfo>,
    pub queue_depth: usize,
    pub delayed_depth: usize,
    pub dlq_depth: usize,
}

pub struct ClusterManager {
    config: ClusterConfig,
    coord: Arc<dyn CoordStore>,
    store: SharedStore,
    registry: NodeRegistry,
    queue: ClusterQueue,
    in_flight: Mutex<HashSet<JobId>>,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl ClusterManager {
    pub fn new(coord: Arc<dyn CoordStore>, config: ClusterConfig) -> Self {
        let registry = NodeRegistry::new(
            Arc::clone(&coord),
            config.cluster.clone(),
            config.heartbeat_interval,
        );
        let queue = ClusterQueue::new(Arc::clone(&coord), config.cluster.clone());
        let store = SharedStore::new(Arc::clone(&coord));
        Self {
            config,
            coord,
            store,
            registry,
            queue,
            in_flight: Mutex::new(HashSet::new()),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Canonical job records live in the shared store.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Persist and enqueue a job.
    pub fn submit(&self, job: &Job) -> Result<()> {
        self.store.save(job)?;
        self.queue.enqueue(&job.id, job.priority);
        Ok(())
    }

    /// Cancel a pending job: out of the queue and marked cancelled.
    pub fn cancel(&self, id: &JobId) -> Result<bool> {
        let cancelled = self.store.cancel_pending(id)?;
        if cancelled {
            self.queue.remove(id);
        }
        Ok(cancelled)
    }

    fn local_load(&self) -> f64 {
        let in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len();
        if self.config.capacity == 0 {
            1.0
        } else {
            in_flight as f64 / self.config.capacity as f64
        }
    }

    fn has_local_capacity(&self) -> bool {
        self.local_load() < 1.0
    }

    /// Pull-based claim: pop the queue head and take ownership.
    ///
    /// A popped id whose record is no longer claimable (cancelled, or
    /// raced by a direct store write) is a claim conflict; it is logged
    /// and the next head is tried, per the cooperative protocol.
    pub fn try_claim(&self) -> Result<Option<Job>> {
        if !self.has_local_capacity() || !self.registry.may_claim(&self.config.node_id)? {
            return Ok(None);
        }

        loop {
            let Some(id) = self.queue.pop() else {
                return Ok(None);
            };
            match self.store.claim(&id, &self.config.node_id)? {
                Some(job) => {
                    self.coord.set_with_ttl(
                        &claim_key(&self.config.cluster, &self.config.node_id, id.as_str()),
                        "",
                        self.config.claim_ttl,
                    );
                    self.in_flight
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .insert(id.clone());
                    info!(job = %id, node = %self.config.node_id, "claimed job");
                    return Ok(Some(job));
                }
                None => {
                    debug!(job = %id, "claim conflict, re-polling queue head");
                    continue;
                }
            }
        }
    }

    fn release(&self, id: &JobId) {
        self.coord.del(&claim_key(
            &self.config.cluster,
            &self.config.node_id,
            id.as_str(),
        ));
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
    }

    /// Record a successful execution.
    pub fn complete(
        &self,
        id: &JobId,
        results: Vec<Value>,
        context: &Map<String, Value>,
    ) -> Result<()> {
        self.store.update_results(id, results, "")?;
        self.store.update_context(id, context)?;
        self.store.update_status(id, JobStatus::Completed)?;
        self.release(id);
        self.completed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Record a failed execution and apply retry policy.
    pub fn fail(&self, id: &JobId, error: &str) -> Result<Disposition> {
        self.release(id);
        self.failed.fetch_add(1, Ordering::Relaxed);
        let Some(job) = self.store.load(id)? else {
            warn!(job = %id, "failed job vanished from store");
            return Ok(Disposition::DeadLettered);
        };
        self.retry_or_dead_letter(job, error)
    }

    fn retry_or_dead_letter(&self, mut job: Job, error: &str) -> Result<Disposition> {
        if job.retry_count < self.config.max_retries {
            job.mark_retrying();
            let attempt = job.retry_count;
            let ready_at = Utc::now() + ChronoDuration::from_std(retry_delay(attempt)).unwrap_or_default();
            self.store.save(&job)?;
            self.queue.enqueue_delayed(&job.id, job.priority, ready_at);
            info!(job = %job.id, attempt, error, "retry scheduled");
            Ok(Disposition::Retried { attempt, ready_at })
        } else {
            let exhausted = crate::error::ClusterError::RetryBudgetExhausted(job.id.to_string());
            job.mark_failed(format!("{}; last error: {}", exhausted, error));
            self.store.save(&job)?;
            self.queue.dead_letter(&job.id);
            warn!(job = %job.id, retries = job.retry_count, "moved to dead-letter queue");
            Ok(Disposition::DeadLettered)
        }
    }

    /// Refresh this node's record and the claim markers for everything
    /// it is executing.
    pub fn heartbeat(&self) -> Result<()> {
        let in_flight: Vec<JobId> = self
            .in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect();

        for id in &in_flight {
            self.coord.set_with_ttl(
                &claim_key(&self.config.cluster, &self.config.node_id, id.as_str()),
                "",
                self.config.claim_ttl,
            );
        }

        let mut node = NodeInfo::new(
            self.config.node_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        node.load = self.local_load();
        node.running_jobs = in_flight.len() as u64;
        node.completed_jobs = self.completed.load(Ordering::Relaxed);
        node.failed_jobs = self.failed.load(Ordering::Relaxed);
        self.registry.heartbeat(&node)
    }

    /// One janitor pass. Any node may run this; every step is
    /// idempotent.
    pub fn janitor_sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport {
            pumped: self.queue.pump_delayed(),
            ..SweepReport::default()
        };

        // Silent nodes become inactive; their jobs are requeued below
        // once the claim markers expire.
        for node in self.registry.stale_nodes()? {
            warn!(node = %node.id, last_seen = %node.last_seen, "node missed heartbeats");
            self.registry.mark_inactive(&node)?;
            report.nodes_lost.push(node.id);
        }
        for node in self.registry.expired_nodes()? {
            info!(node = %node.id, "evicting long-silent node");
            self.registry.evict(&node.id);
        }

        let timeout_horizon = Utc::now()
            - ChronoDuration::from_std(self.config.job_timeout).unwrap_or_default();

        for job in self.store.list(Some(JobStatus::Running), usize::MAX)? {
            let Some(node) = job.assigned_node.clone() else {
                continue;
            };

            let is_mine = node == self.config.node_id;
            let timed_out = job.started_at.map(|t| t < timeout_horizon).unwrap_or(false);

            if is_mine && timed_out {
                // The owning node enforces its own job clock
                self.release(&job.id);
                let id = job.id.clone();
                match self.retry_or_dead_letter(
                    job,
                    &format!("job timeout after {}s", self.config.job_timeout.as_secs()),
                )? {
                    Disposition::Retried { .. } => report.requeued.push(id.clone()),
                    Disposition::DeadLettered => report.dead_lettered.push(id.clone()),
                }
                report.timed_out.push(id);
                continue;
            }

            if !is_mine {
                let claim = claim_key(&self.config.cluster, &node, job.id.as_str());
                if self.coord.get(&claim).is_none() {
                    // Claim TTL expired: the owner crashed or vanished
                    warn!(job = %job.id, node = %node, "claim expired, requeueing");
                    let id = job.id.clone();
                    match self.retry_or_dead_letter(
                        job,
                        &format!("claim expired on node '{}'", node),
                    )? {
                        Disposition::Retried { .. } => report.requeued.push(id),
                        Disposition::DeadLettered => report.dead_lettered.push(id),
                    }
                }
            }
        }

        Ok(report)
    }

    pub fn info(&self) -> Result<ClusterInfo> {
        Ok(ClusterInfo {
            nodes: self.registry.nodes()?,
            queue_depth: self.queue.depth(),
            delayed_depth: self.queue.delayed_depth(),
            dlq_depth: self.queue.dlq(usize::MAX).len(),
        })
    }

    /// Jobs parked in the dead-letter queue, oldest first.
    pub fn dlq_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for id in self.queue.dlq(limit) {
            if let Some(job) = self.store.load(&id)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

/// Exponential retry delay: 2^attempt seconds, capped, with a little
/// jitter so simultaneous failures do not retry in lockstep.
pub fn retry_delay(attempt: u32) -> Duration {
    let base = RETRY_DELAY_BASE_SECS
        .saturating_pow(attempt)
        .min(RETRY_DELAY_CAP_SECS);
    let jitter = rand::thread_rng().gen_range(0..250);
    Duration::from_secs(base) + Duration::from_millis(jitter)
}
