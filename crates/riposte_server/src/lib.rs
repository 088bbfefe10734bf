//! Riposte automation server.
//!
//! Callers hand `(playbook, context)` tuples to [`api::Server`]; jobs
//! persist through the job store, execute on a bounded worker pool (or
//! across the cluster when enabled), and emit webhook events on every
//! state transition.

pub mod api;
pub mod cluster_runtime;
pub mod config;
pub mod error;
pub mod executor;
pub mod manager;
pub mod scheduler;
pub mod webhook;

pub use api::Server;
pub use config::{ClusterSettings, ServerConfig, StoreBackend};
pub use error::{Result, ServerError};
pub use executor::EngineDeps;
pub use manager::{JobManager, ManagerConfig};
pub use scheduler::Scheduler;
pub use webhook::{HttpTransport, Notifier, WebhookSink, WebhookTransport};
