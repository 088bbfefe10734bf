//! Plugin host for the three plugin flavours.
//!
//! Executables and interpreted scripts speak the CLI contract
//! (`info` / `execute <json>` / `cleanup`, stdout=JSON stderr=logs);
//! dynamic modules expose the same contract as C symbols. Discovery is
//! by file extension in the configured plugins directory, with hot
//! reload driven by filesystem notifications.

pub mod contract;
pub mod dynamic;
pub mod host;
pub mod watcher;

pub use contract::PluginInfo;
pub use dynamic::dynamic_loading_supported;
pub use host::{flavour_for_path, PluginHost, PluginHostConfig};
pub use watcher::{watch, PluginWatcher};
