//! Cluster coordination for Riposte.
//!
//! Replaces local dispatch when cluster mode is enabled: jobs queue in
//! the shared store ordered by priority then age, nodes heartbeat and
//! pull work cooperatively, and a janitor recovers from crashed or
//! silent nodes. State lives entirely behind the
//! [`riposte_store::CoordStore`] interface.

pub mod error;
pub mod keys;
pub mod manager;
pub mod queue;
pub mod registry;

pub use error::{ClusterError, Result};
pub use manager::{retry_delay, ClusterConfig, ClusterInfo, ClusterManager, Disposition, SweepReport};
pub use queue::ClusterQueue;
pub use registry::NodeRegistry;
