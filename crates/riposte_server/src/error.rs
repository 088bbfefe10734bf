//! Server-level error type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Rejected at submission: the playbook failed validation.
    #[error(transparent)]
    Validation(#[from] riposte_engine::EngineError),

    #[error(transparent)]
    Store(#[from] riposte_store::StoreError),

    #[error(transparent)]
    Cluster(#[from] riposte_cluster::ClusterError),

    #[error(transparent)]
    Plugin(#[from] riposte_engine::PluginError),

    #[error("job not found: {0}")]
    JobNotFound(String),
}
