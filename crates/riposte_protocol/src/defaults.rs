//! Canonical default values shared across the server, store, and cluster.

/// Worker pool size when not configured.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 4;
/// Hard worker cap.
pub const HARD_MAX_WORKERS: usize = 32;

/// Heartbeat interval for cluster nodes (seconds).
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;
/// Heartbeats a node may miss before being marked inactive.
pub const MISSED_HEARTBEATS_BEFORE_INACTIVE: u32 = 3;

/// Per-job execution clock (seconds).
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 300;
/// Automation script subprocess timeout (seconds).
pub const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 300;

/// Retry budget before a job moves to the dead-letter queue.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Base for the exponential re-enqueue delay (2^attempt seconds).
pub const RETRY_DELAY_BASE_SECS: u64 = 2;
/// Cap on the re-enqueue delay (seconds).
pub const RETRY_DELAY_CAP_SECS: u64 = 60;

/// TTL for claim markers in the shared store (seconds).
pub const DEFAULT_CLAIM_TTL_SECS: u64 = 60;
/// TTL for terminal job records in the shared store (24 h).
pub const TERMINAL_JOB_TTL_SECS: u64 = 24 * 60 * 60;

/// Cleanup ticker period (24 h) and retention horizon (30 days).
pub const CLEANUP_INTERVAL_SECS: u64 = 24 * 60 * 60;
pub const CLEANUP_RETENTION_DAYS: i64 = 30;
/// Backup ticker period (7 days).
pub const BACKUP_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

/// Completed jobs sampled for the average-duration statistic.
pub const STATS_DURATION_WINDOW: usize = 50;

/// Plugin stdout cap (10 MiB).
pub const MAX_PLUGIN_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Webhook delivery retry budget and backoff base (milliseconds).
pub const WEBHOOK_MAX_RETRIES: u32 = 3;
pub const WEBHOOK_BACKOFF_BASE_MS: u64 = 500;
/// Bounded webhook delivery queue depth.
pub const WEBHOOK_QUEUE_DEPTH: usize = 256;

/// Error recorded on jobs found running during startup recovery.
pub const INTERRUPTED_MESSAGE: &str = "interrupted: server restarted during execution";
/// Policy message returned when cancelling a running job.
pub const CANNOT_CANCEL_RUNNING_MESSAGE: &str =
    "running jobs cannot be interrupted; pause schedules to stop future runs";
