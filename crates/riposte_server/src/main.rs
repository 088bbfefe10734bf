//! Riposte automation server daemon.
//!
//! Evaluates JSON playbooks against a per-job context, dispatching
//! automation scripts and plugins, with durable job records and
//! optional cluster coordination.
//!
//! Usage:
//!     riposted --data-dir ~/.riposte/data --store sqlite --workers 8

use clap::Parser;
use riposte_logging::LogConfig;
use riposte_protocol::defaults;
use riposte_server::{ClusterSettings, Server, ServerConfig, StoreBackend};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "riposted", about = "Riposte SOAR automation server")]
struct Args {
    /// Data directory for job records, playbooks, scripts, and plugins
    #[arg(long, env = "RIPOSTE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Job store backend: file, sqlite, or shared
    #[arg(long, default_value = "file")]
    store: StoreBackend,

    /// Worker pool size
    #[arg(long, default_value_t = defaults::DEFAULT_WORKER_POOL_SIZE)]
    workers: usize,

    /// Automation scripts directory (default: <data-dir>/scripts)
    #[arg(long)]
    scripts_dir: Option<PathBuf>,

    /// Playbook library directory (default: <data-dir>/playbooks)
    #[arg(long)]
    playbooks_dir: Option<PathBuf>,

    /// Plugins directory (default: <data-dir>/plugins)
    #[arg(long)]
    plugins_dir: Option<PathBuf>,

    /// Interpreter for automation scripts (path or command name)
    #[arg(long, default_value = "python3")]
    interpreter: PathBuf,

    /// Deliver script payloads on stdin instead of as an argument
    #[arg(long)]
    script_stdin: bool,

    /// Automation script timeout in seconds
    #[arg(long, default_value_t = defaults::DEFAULT_SCRIPT_TIMEOUT_SECS)]
    script_timeout: u64,

    /// Per-job execution timeout in seconds (cluster mode)
    #[arg(long, default_value_t = defaults::DEFAULT_JOB_TIMEOUT_SECS)]
    job_timeout: u64,

    /// Retry budget before a job is dead-lettered (cluster mode)
    #[arg(long, default_value_t = defaults::DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Enable cluster mode by naming the cluster
    #[arg(long)]
    cluster: Option<String>,

    /// Stable node id (cluster mode; defaults to the hostname)
    #[arg(long)]
    node_id: Option<String>,

    /// Advertised host (cluster mode)
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Advertised port (cluster mode)
    #[arg(long, default_value_t = 7700)]
    port: u16,

    /// Heartbeat interval in seconds (cluster mode)
    #[arg(long, default_value_t = defaults::DEFAULT_HEARTBEAT_SECS)]
    heartbeat_secs: u64,

    /// Claim TTL in seconds (cluster mode)
    #[arg(long, default_value_t = defaults::DEFAULT_CLAIM_TTL_SECS)]
    claim_ttl_secs: u64,

    /// Passphrase for the integration config vault
    #[arg(long, env = "RIPOSTE_VAULT_KEY")]
    vault_key: Option<String>,

    /// Mirror the full log to stderr
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Guard flushes buffered log lines when main returns
    let _log_guard = riposte_logging::init_logging(LogConfig {
        app_name: "riposted",
        verbose: args.verbose,
    })?;

    let config = build_config(args)?;
    tracing::info!("Starting Riposte");
    tracing::info!("  Data dir: {}", config.data_dir.display());
    tracing::info!("  Store: {:?}", config.store_backend);
    tracing::info!("  Workers: {}", config.worker_pool_size_clamped());
    if let Some(cluster) = &config.cluster {
        tracing::info!("  Cluster: {} (node {})", cluster.cluster, cluster.node_id);
    }

    let server = Server::start(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    server.shutdown();
    Ok(())
}

fn build_config(args: Args) -> anyhow::Result<ServerConfig> {
    let data_dir = args
        .data_dir
        .unwrap_or_else(riposte_protocol::paths::default_data_dir);

    let mut config = ServerConfig::with_data_dir(data_dir);
    config.store_backend = args.store;
    config.worker_pool_size = args.workers;
    if let Some(dir) = args.scripts_dir {
        config.scripts_dir = dir;
    }
    if let Some(dir) = args.playbooks_dir {
        config.playbooks_dir = dir;
    }
    if let Some(dir) = args.plugins_dir {
        config.plugins_dir = dir;
    }
    config.interpreter = args.interpreter;
    config.script_payload_via_stdin = args.script_stdin;
    config.script_timeout = Duration::from_secs(args.script_timeout);
    config.job_timeout = Duration::from_secs(args.job_timeout);
    config.max_retries = args.max_retries;
    config.vault_key = args.vault_key;

    if let Some(cluster) = args.cluster {
        let node_id = match args.node_id {
            Some(id) => id,
            None => hostname_or_random(),
        };
        config.cluster = Some(ClusterSettings {
            cluster,
            node_id,
            host: args.host,
            port: args.port,
            heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
            claim_ttl: Duration::from_secs(args.claim_ttl_secs),
        });
        // Cluster mode keeps job records in the shared store
        config.store_backend = StoreBackend::Shared;
    }

    Ok(config)
}

fn hostname_or_random() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("node-{}", uuid_suffix()))
}

fn uuid_suffix() -> String {
    riposte_protocol::JobId::generate()
        .as_str()
        .chars()
        .take(8)
        .collect()
}
