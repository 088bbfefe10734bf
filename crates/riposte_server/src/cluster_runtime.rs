//! Cluster-mode runtime: drives the cluster manager's loops on this
//! node and executes claimed jobs.
//!
//! Three periodic tasks per node: heartbeat (node record + claim
//! refresh), claim polling (pull work while capacity lasts), and the
//! janitor (requeue expired claims, evict silent nodes, enforce job
//! timeouts). Execution itself reuses the same blocking-pool
//! evaluation path as local mode.

use crate::executor::{evaluate_on_blocking_pool, EngineDeps};
use crate::webhook::Notifier;
use riposte_cluster::{ClusterConfig, ClusterInfo, ClusterManager, Disposition};
use riposte_protocol::{Event, EventKind, Job};
use riposte_store::CoordStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct ClusterRuntime {
    manager: Arc<ClusterManager>,
    deps: Arc<EngineDeps>,
    notifier: Arc<Notifier>,
    capacity: usize,
}

impl ClusterRuntime {
    pub fn start(
        coord: Arc<dyn CoordStore>,
        config: ClusterConfig,
        deps: Arc<EngineDeps>,
        notifier: Arc<Notifier>,
    ) -> Arc<Self> {
        let heartbeat_interval = config.heartbeat_interval;
        let claim_ttl = config.claim_ttl;
        let capacity = config.capacity.max(1);
        let manager = Arc::new(ClusterManager::new(coord, config));

        let runtime = Arc::new(Self {
            manager,
            deps,
            notifier,
            capacity,
        });

        runtime.spawn_heartbeat(heartbeat_interval);
        runtime.spawn_claim_loop();
        runtime.spawn_janitor(claim_ttl);
        info!(node = runtime.manager.node_id(), "cluster runtime started");
        runtime
    }

    pub fn manager(&self) -> &Arc<ClusterManager> {
        &self.manager
    }

    fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut announced = false;
            loop {
                ticker.tick().await;
                match runtime.manager.heartbeat() {
                    Ok(()) if !announced => {
                        announced = true;
                        runtime.notifier.emit(Event::for_node(
                            EventKind::NodeJoined,
                            runtime.manager.node_id().to_string(),
                        ));
                    }
                    Ok(()) => {}
                    Err(e) => warn!("heartbeat failed: {}", e),
                }
            }
        });
    }

    fn spawn_claim_loop(self: &Arc<Self>) {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let slots = Arc::new(Semaphore::new(runtime.capacity));
            let mut ticker = tokio::time::interval(CLAIM_POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Claim as long as this node has free slots and is the
                // least-loaded eligible node
                loop {
                    if slots.available_permits() == 0 {
                        break;
                    }
                    let claimed = match runtime.manager.try_claim() {
                        Ok(Some(job)) => job,
                        Ok(None) => break,
                        Err(e) => {
                            warn!("claim attempt failed: {}", e);
                            break;
                        }
                    };
                    let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                        break;
                    };
                    let runtime = Arc::clone(&runtime);
                    tokio::spawn(async move {
                        runtime.execute(claimed).await;
                        drop(permit);
                    });
                }
            }
        });
    }

    fn spawn_janitor(self: &Arc<Self>, claim_ttl: Duration) {
        let runtime = Arc::clone(self);
        // Sweep at half the claim TTL so an expired claim is noticed
        // within one TTL
        let interval = (claim_ttl / 2).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match runtime.manager.janitor_sweep() {
                    Ok(report) => {
                        for node in &report.nodes_lost {
                            runtime
                                .notifier
                                .emit(Event::for_node(EventKind::NodeLost, node.clone()));
                        }
                        for id in &report.requeued {
                            runtime
                                .notifier
                                .emit(Event::for_job(EventKind::JobRecovered, id.clone()));
                        }
                        for id in &report.dead_lettered {
                            runtime
                                .notifier
                                .emit(Event::for_job(EventKind::JobFailed, id.clone()));
                        }
                    }
                    Err(e) => warn!("janitor sweep failed: {}", e),
                }
            }
        });
    }

    async fn execute(&self, job: Job) {
        let id = job.id.clone();
        self.notifier
            .emit(Event::for_job(EventKind::JobStarted, id.clone()));
        info!(job = %id, "executing claimed job");

        match evaluate_on_blocking_pool(Arc::clone(&self.deps), job).await {
            Ok((results, context)) => match self.manager.complete(&id, results, &context) {
                Ok(()) => {
                    self.notifier
                        .emit(Event::for_job(EventKind::JobCompleted, id.clone()));
                    info!(job = %id, "job completed");
                }
                Err(e) => error!(job = %id, "failed to record completion: {}", e),
            },
            Err(message) => {
                warn!(job = %id, "job failed: {}", message);
                match self.manager.fail(&id, &message) {
                    // Retries are internal; only terminal failure
                    // surfaces as an event
                    Ok(Disposition::Retried { attempt, .. }) => {
                        debug!(job = %id, attempt, "failure will retry");
                    }
                    Ok(Disposition::DeadLettered) => {
                        self.notifier
                            .emit(Event::for_job(EventKind::JobFailed, id.clone()));
                    }
                    Err(e) => error!(job = %id, "failed to record failure: {}", e),
                }
            }
        }
    }

    pub fn info(&self) -> riposte_cluster::Result<ClusterInfo> {
        self.manager.info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::deps_with_scripts;
    use crate::webhook::testing::RecordingTransport;
    use crate::webhook::WebhookTransport;
    use riposte_protocol::JobStatus;
    use riposte_store::MemoryCoordStore;
    use serde_json::{json, Map};

    fn cluster_config(node: &str) -> ClusterConfig {
        ClusterConfig {
            cluster: "test".to_string(),
            node_id: node.to_string(),
            host: "127.0.0.1".to_string(),
            port: 7700,
            capacity: 2,
            heartbeat_interval: Duration::from_millis(100),
            job_timeout: Duration::from_secs(60),
            max_retries: 1,
            claim_ttl: Duration::from_secs(5),
        }
    }

    async fn wait_for_terminal(runtime: &ClusterRuntime, job: &Job) -> Job {
        for _ in 0..300 {
            let current = runtime.manager.store().load(&job.id).unwrap().unwrap();
            if current.is_terminal() {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn test_cluster_executes_submitted_job() {
        let coord: Arc<dyn CoordStore> = Arc::new(MemoryCoordStore::new());
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Notifier::new(transport.clone() as Arc<dyn WebhookTransport>);

        let runtime = ClusterRuntime::start(
            coord,
            cluster_config("n1"),
            deps_with_scripts(&[("hello", json!({"greeting": "world"}))]),
            notifier,
        );

        let job = Job::new(vec![json!({"run": "hello"})], Map::new());
        runtime.manager.submit(&job).unwrap();

        let done = wait_for_terminal(&runtime, &job).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.context.get("greeting"), Some(&json!("world")));
    }

    #[tokio::test]
    async fn test_cluster_failure_retries_then_dead_letters() {
        let coord: Arc<dyn CoordStore> = Arc::new(MemoryCoordStore::new());
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Notifier::new(transport.clone() as Arc<dyn WebhookTransport>);

        let runtime = ClusterRuntime::start(
            coord.clone(),
            cluster_config("n1"),
            deps_with_scripts(&[]),
            notifier,
        );

        let job = Job::new(vec![json!({"run": "missing"})], Map::new());
        runtime.manager.submit(&job).unwrap();

        // max_retries = 1: first failure retries with ~2s delay; rather
        // than wait for the delay, verify the job left the running
        // state and is either pending-retry or dead-lettered
        for _ in 0..300 {
            let current = runtime.manager.store().load(&job.id).unwrap().unwrap();
            if current.retry_count >= 1 || current.is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("failure never processed");
    }
}
