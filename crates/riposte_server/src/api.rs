//! The server facade: the surface the outer layers (HTTP handlers,
//! CLI) call into. Wires stores, engine dependencies, plugin host,
//! scheduler, webhooks, and the optional cluster runtime together, and
//! routes each operation to the local manager or the cluster.

use crate::cluster_runtime::ClusterRuntime;
use crate::config::{ServerConfig, StoreBackend};
use crate::error::{Result, ServerError};
use crate::executor::EngineDeps;
use crate::manager::{JobManager, ManagerConfig};
use crate::scheduler::{schedule_tag, Scheduler};
use crate::webhook::{HttpTransport, Notifier, WebhookSink};
use anyhow::Context as AnyhowContext;
use riposte_cluster::{ClusterConfig, ClusterInfo};
use riposte_engine::{
    DirLibrary, PlaybookSource, PluginError, PluginInvoker, ScriptError, ScriptRunner,
};
use riposte_plugins::{PluginHost, PluginHostConfig, PluginWatcher};
use riposte_protocol::defaults::CANNOT_CANCEL_RUNNING_MESSAGE;
use riposte_protocol::{paths, Event, EventKind, Job, JobId, JobStatus, PluginRecord, Schedule};
use riposte_runner::{ArgStyle, AutomationRunner, RunnerConfig};
use riposte_store::{CoordStore, JobStore, MemoryCoordStore, StoreStats};
use riposte_vault::Vault;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

enum Backend {
    Local(Arc<JobManager>),
    Cluster(Arc<ClusterRuntime>),
}

pub struct Server {
    backend: Backend,
    plugins: Arc<PluginHost>,
    notifier: Arc<Notifier>,
    scheduler: Arc<Scheduler>,
    library: DirLibrary,
    vault: Option<Arc<Vault>>,
    // Mutex only for Sync; the watcher is held, never touched
    _watcher: Option<std::sync::Mutex<PluginWatcher>>,
}

impl Server {
    /// Assemble and start everything from configuration. Called once
    /// by the binary.
    pub async fn start(config: ServerConfig) -> anyhow::Result<Arc<Self>> {
        for dir in [
            &config.data_dir,
            &config.scripts_dir,
            &config.playbooks_dir,
            &config.plugins_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let vault = match &config.vault_key {
            Some(key) => Some(Arc::new(
                Vault::open(paths::vault_file(&config.data_dir), key)
                    .context("failed to open integration config vault")?,
            )),
            None => None,
        };

        let interpreter =
            riposte_runner::resolve_interpreter(Some(&config.interpreter), None)
                .map_err(anyhow::Error::msg)?;
        info!(interpreter = %interpreter.display(), "script interpreter resolved");

        let runner = AutomationRunner::new(RunnerConfig {
            scripts_dir: config.scripts_dir.clone(),
            interpreter: interpreter.clone(),
            timeout: config.script_timeout,
            arg_style: if config.script_payload_via_stdin {
                ArgStyle::Stdin
            } else {
                ArgStyle::Argument
            },
        });

        let mut host_config = PluginHostConfig::new(&config.plugins_dir, &interpreter);
        host_config.timeout = config.script_timeout;
        let plugins = Arc::new(PluginHost::new(host_config));
        plugins.scan();
        let watcher = match riposte_plugins::watch(Arc::clone(&plugins), &config.plugins_dir) {
            Ok(watcher) => Some(std::sync::Mutex::new(watcher)),
            Err(e) => {
                warn!("plugin hot reload disabled: {}", e);
                None
            }
        };

        // Scripts and plugins see vault credentials only through
        // explicit parameter injection
        let scripts: Box<dyn ScriptRunner> = match &vault {
            Some(vault) => Box::new(VaultScripts {
                inner: Box::new(runner),
                vault: Arc::clone(vault),
            }),
            None => Box::new(runner),
        };
        let invoker: Arc<dyn PluginInvoker> = match &vault {
            Some(vault) => Arc::new(VaultPlugins {
                inner: Arc::clone(&plugins) as Arc<dyn PluginInvoker>,
                vault: Arc::clone(vault),
            }),
            None => Arc::clone(&plugins) as Arc<dyn PluginInvoker>,
        };

        let deps = EngineDeps::new(
            scripts,
            invoker,
            Box::new(DirLibrary::new(&config.playbooks_dir)),
        );
        let notifier = Notifier::new(Arc::new(HttpTransport::new()));

        let workers = config.worker_pool_size_clamped();
        let backend = match &config.cluster {
            Some(settings) => {
                let coord: Arc<dyn CoordStore> = Arc::new(MemoryCoordStore::new());
                let runtime = ClusterRuntime::start(
                    coord,
                    ClusterConfig {
                        cluster: settings.cluster.clone(),
                        node_id: settings.node_id.clone(),
                        host: settings.host.clone(),
                        port: settings.port,
                        capacity: workers,
                        heartbeat_interval: settings.heartbeat_interval,
                        job_timeout: config.job_timeout,
                        max_retries: config.max_retries,
                        claim_ttl: settings.claim_ttl,
                    },
                    deps,
                    Arc::clone(&notifier),
                );
                Backend::Cluster(runtime)
            }
            None => {
                let store = match config.store_backend {
                    StoreBackend::File => {
                        JobStore::open_file(paths::jobs_file(&config.data_dir))?
                    }
                    StoreBackend::Sqlite => {
                        JobStore::open_sqlite(paths::jobs_db(&config.data_dir)).await?
                    }
                    StoreBackend::Shared => {
                        JobStore::open_shared(Arc::new(MemoryCoordStore::new()))
                    }
                };
                let manager = JobManager::start(
                    Arc::new(store),
                    deps,
                    Arc::clone(&notifier),
                    ManagerConfig {
                        workers,
                        node_name: "local".to_string(),
                        cleanup_interval: config.cleanup_interval,
                        backup_interval: config.backup_interval,
                        dispatch_sweep_interval: config.dispatch_sweep_interval,
                        ..ManagerConfig::default()
                    },
                );
                let recovered = manager.recover().await?;
                if recovered > 0 {
                    info!(recovered, "interrupted jobs failed during recovery");
                }
                manager.spawn_tickers();
                Backend::Local(manager)
            }
        };

        let (scheduler, fire_rx) = Scheduler::new();
        scheduler.spawn();

        let server = Arc::new(Self {
            backend,
            plugins,
            notifier,
            scheduler,
            library: DirLibrary::new(&config.playbooks_dir),
            vault,
            _watcher: watcher,
        });
        server.clone().spawn_schedule_consumer(fire_rx);
        Ok(server)
    }

    /// Submit: persist a job and hand it to the active dispatch layer.
    pub async fn submit(
        &self,
        playbook: Vec<Value>,
        context: Map<String, Value>,
        priority: i64,
        tags: Vec<String>,
    ) -> Result<JobId> {
        match &self.backend {
            Backend::Local(manager) => manager.submit(playbook, context, priority, tags).await,
            Backend::Cluster(runtime) => {
                riposte_engine::parse_playbook(&playbook)?;
                let job = Job::new(playbook, context)
                    .with_priority(priority)
                    .with_tags(tags);
                let id = job.id.clone();
                runtime.manager().submit(&job)?;
                self.notifier
                    .emit(Event::for_job(EventKind::JobSubmitted, id.clone()));
                Ok(id)
            }
        }
    }

    pub async fn poll(&self, id: &JobId) -> Result<Job> {
        match &self.backend {
            Backend::Local(manager) => manager.poll(id).await,
            Backend::Cluster(runtime) => runtime
                .manager()
                .store()
                .load(id)?
                .ok_or_else(|| ServerError::JobNotFound(id.to_string())),
        }
    }

    pub async fn cancel(&self, id: &JobId) -> Result<(bool, String)> {
        match &self.backend {
            Backend::Local(manager) => manager.cancel(id).await,
            Backend::Cluster(runtime) => {
                if runtime.manager().cancel(id)? {
                    self.notifier
                        .emit(Event::for_job(EventKind::JobCancelled, id.clone()));
                    return Ok((true, "job cancelled".to_string()));
                }
                match runtime.manager().store().load(id)? {
                    Some(job) if job.status == JobStatus::Running => {
                        Ok((false, CANNOT_CANCEL_RUNNING_MESSAGE.to_string()))
                    }
                    Some(job) => Ok((false, format!("job is already {}", job.status))),
                    None => Err(ServerError::JobNotFound(id.to_string())),
                }
            }
        }
    }

    pub async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        match &self.backend {
            Backend::Local(manager) => manager.list(status, limit).await,
            Backend::Cluster(runtime) => Ok(runtime.manager().store().list(status, limit)?),
        }
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        match &self.backend {
            Backend::Local(manager) => manager.stats().await,
            Backend::Cluster(runtime) => Ok(runtime
                .manager()
                .store()
                .stats(riposte_protocol::defaults::STATS_DURATION_WINDOW)?),
        }
    }

    /// Node list + queue depth; `None` outside cluster mode.
    pub fn cluster_info(&self) -> Result<Option<ClusterInfo>> {
        match &self.backend {
            Backend::Local(_) => Ok(None),
            Backend::Cluster(runtime) => Ok(Some(runtime.info()?)),
        }
    }

    /// Dead-lettered jobs, oldest first; empty outside cluster mode.
    pub fn dlq(&self, limit: usize) -> Result<Vec<Job>> {
        match &self.backend {
            Backend::Local(_) => Ok(Vec::new()),
            Backend::Cluster(runtime) => Ok(runtime.manager().dlq_jobs(limit)?),
        }
    }

    /// Direct plugin execution path.
    pub async fn execute_plugin(&self, name: String, params: Map<String, Value>) -> Result<Value> {
        let plugins = Arc::clone(&self.plugins);
        let result = tokio::task::spawn_blocking(move || plugins.execute(&name, &params))
            .await
            .map_err(|e| {
                ServerError::Plugin(PluginError::ExecFailed {
                    plugin: "unknown".to_string(),
                    message: e.to_string(),
                })
            })?;
        Ok(result?)
    }

    pub fn plugin_records(&self) -> Vec<PluginRecord> {
        self.plugins.records()
    }

    pub fn register_webhook(&self, sink: WebhookSink) {
        self.notifier.register(sink);
    }

    pub fn add_schedule(&self, schedule: Schedule) -> std::result::Result<(), String> {
        self.scheduler.add(schedule)
    }

    pub fn schedules(&self) -> Vec<Schedule> {
        self.scheduler.list()
    }

    pub fn set_schedule_enabled(&self, id: &str, enabled: bool) -> bool {
        self.scheduler.set_enabled(id, enabled)
    }

    pub fn vault(&self) -> Option<&Arc<Vault>> {
        self.vault.as_ref()
    }

    /// Release plugin resources; call on shutdown.
    pub fn shutdown(&self) {
        self.plugins.cleanup_all();
    }

    fn spawn_schedule_consumer(
        self: Arc<Self>,
        mut fire_rx: tokio::sync::mpsc::Receiver<Schedule>,
    ) {
        tokio::spawn(async move {
            while let Some(schedule) = fire_rx.recv().await {
                if let Err(e) = self.materialise_schedule(&schedule).await {
                    warn!(schedule = %schedule.id, "schedule firing failed: {}", e);
                }
            }
        });
    }

    /// Turn a due schedule into a job, unless the previous invocation
    /// is still active (overlap policy: skip).
    async fn materialise_schedule(&self, schedule: &Schedule) -> Result<()> {
        let tag = schedule_tag(&schedule.id);

        for status in [JobStatus::Pending, JobStatus::Running] {
            let active = self.list(Some(status), usize::MAX).await?;
            if active.iter().any(|job| job.tags.contains(&tag)) {
                info!(schedule = %schedule.id, "previous invocation still active, skipping tick");
                return Ok(());
            }
        }

        let playbook = self.library.load(&schedule.playbook)?;
        let id = self
            .submit(playbook, schedule.context.clone(), 0, vec![tag])
            .await?;
        info!(schedule = %schedule.id, job = %id, "schedule materialised job");
        Ok(())
    }
}

/// Injects vault credentials into payloads that name an integration:
/// `{"integration": "<name>"}` gains `integration_config` with that
/// integration's credential map.
fn inject_integration(payload: &Map<String, Value>, vault: &Vault) -> Map<String, Value> {
    let Some(Value::String(name)) = payload.get("integration") else {
        return payload.clone();
    };
    match vault.get(name) {
        Ok(credentials) => {
            let mut enriched = payload.clone();
            enriched.insert(
                "integration_config".to_string(),
                Value::Object(credentials),
            );
            enriched
        }
        Err(e) => {
            warn!(integration = %name, "credentials unavailable: {}", e);
            payload.clone()
        }
    }
}

struct VaultScripts {
    inner: Box<dyn ScriptRunner>,
    vault: Arc<Vault>,
}

impl ScriptRunner for VaultScripts {
    fn run(
        &self,
        script: &str,
        payload: &Map<String, Value>,
    ) -> std::result::Result<Map<String, Value>, ScriptError> {
        let payload = inject_integration(payload, &self.vault);
        self.inner.run(script, &payload)
    }
}

struct VaultPlugins {
    inner: Arc<dyn PluginInvoker>,
    vault: Arc<Vault>,
}

impl PluginInvoker for VaultPlugins {
    fn execute(
        &self,
        plugin: &str,
        params: &Map<String, Value>,
    ) -> std::result::Result<Value, PluginError> {
        let params = inject_integration(params, &self.vault);
        self.inner.execute(plugin, &params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inject_integration_adds_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path().join("v.enc"), "k").unwrap();
        let mut creds = Map::new();
        creds.insert("api_key".to_string(), json!("vt-123"));
        vault.set("virustotal", creds).unwrap();

        let mut payload = Map::new();
        payload.insert("integration".to_string(), json!("virustotal"));
        let enriched = inject_integration(&payload, &vault);
        assert_eq!(
            enriched["integration_config"]["api_key"],
            json!("vt-123")
        );
    }

    #[test]
    fn test_inject_integration_passthrough_without_name() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path().join("v.enc"), "k").unwrap();
        let mut payload = Map::new();
        payload.insert("other".to_string(), json!(1));
        let enriched = inject_integration(&payload, &vault);
        assert_eq!(enriched, payload);
    }
}
