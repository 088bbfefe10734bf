//! Error types for cluster coordination.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// Lost the race for a queued job; the caller re-polls the queue.
    #[error("claim conflict: job '{0}' was taken or changed state")]
    ClaimConflict(String),

    /// Retries exhausted; the job was moved to the dead-letter queue.
    #[error("retry budget exhausted for job '{0}'")]
    RetryBudgetExhausted(String),

    #[error(transparent)]
    Store(#[from] riposte_store::StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
