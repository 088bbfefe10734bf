//! Canonical types shared across the Riposte automation server.
//!
//! Everything that crosses a crate boundary lives here: the job model,
//! lifecycle enums, cluster node records, plugin records, webhook
//! events, and the default constants for timeouts and intervals.
//! Components keep their own error types; this crate only defines the
//! vocabulary they exchange.

pub mod defaults;
pub mod events;
pub mod job;
pub mod node;
pub mod paths;
pub mod plugin;
pub mod schedule;

// Re-export the canonical types for convenience
pub use events::{Event, EventKind};
pub use job::{Job, JobId, JobIdError, JobStatus};
pub use node::{NodeInfo, NodeStatus};
pub use plugin::{PluginFlavour, PluginRecord, PluginStatus};
pub use schedule::Schedule;
