//! Server configuration (plain data, built by the binary from flags).

use riposte_protocol::defaults;
use std::path::PathBuf;
use std::time::Duration;

/// Which job-store backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// JSON file with atomic renames (data/jobs.json)
    #[default]
    File,
    /// Embedded sqlite database (data/jobs.db)
    Sqlite,
    /// Shared coordination store (implied when cluster mode is on)
    Shared,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(StoreBackend::File),
            "sqlite" => Ok(StoreBackend::Sqlite),
            "shared" => Ok(StoreBackend::Shared),
            _ => Err(format!(
                "unknown store backend '{}'; expected file, sqlite, or shared",
                s
            )),
        }
    }
}

/// Cluster-mode settings.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub cluster: String,
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub heartbeat_interval: Duration,
    pub claim_ttl: Duration,
}

/// Canonical server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub store_backend: StoreBackend,
    pub worker_pool_size: usize,
    pub scripts_dir: PathBuf,
    pub playbooks_dir: PathBuf,
    pub plugins_dir: PathBuf,
    /// Interpreter for automation scripts and script-flavour plugins.
    pub interpreter: PathBuf,
    /// Deliver the JSON payload on stdin instead of as an argument.
    pub script_payload_via_stdin: bool,
    pub script_timeout: Duration,
    pub job_timeout: Duration,
    pub max_retries: u32,
    pub cluster: Option<ClusterSettings>,
    /// Passphrase for the integration config vault; vault disabled when
    /// absent.
    pub vault_key: Option<String>,
    pub cleanup_interval: Duration,
    pub backup_interval: Duration,
    /// How often pending jobs are re-offered to free workers.
    pub dispatch_sweep_interval: Duration,
}

impl ServerConfig {
    /// Defaults rooted at a data directory; the binary overrides
    /// per-flag.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            scripts_dir: data_dir.join("scripts"),
            playbooks_dir: data_dir.join("playbooks"),
            plugins_dir: data_dir.join("plugins"),
            data_dir,
            store_backend: StoreBackend::File,
            worker_pool_size: defaults::DEFAULT_WORKER_POOL_SIZE,
            interpreter: PathBuf::from("python3"),
            script_payload_via_stdin: false,
            script_timeout: Duration::from_secs(defaults::DEFAULT_SCRIPT_TIMEOUT_SECS),
            job_timeout: Duration::from_secs(defaults::DEFAULT_JOB_TIMEOUT_SECS),
            max_retries: defaults::DEFAULT_MAX_RETRIES,
            cluster: None,
            vault_key: None,
            cleanup_interval: Duration::from_secs(defaults::CLEANUP_INTERVAL_SECS),
            backup_interval: Duration::from_secs(defaults::BACKUP_INTERVAL_SECS),
            dispatch_sweep_interval: Duration::from_secs(2),
        }
    }

    pub fn worker_pool_size_clamped(&self) -> usize {
        self.worker_pool_size.clamp(1, defaults::HARD_MAX_WORKERS)
    }
}
