//! The uniform plugin contract.
//!
//! Every plugin answers three commands: `info` (metadata), `execute
//! <params-json>` (work), `cleanup` (release). Out-of-process flavours
//! receive the command as argv with JSON on stdout and logs on stderr;
//! dynamic modules expose the same three capabilities as symbols.

use serde::{Deserialize, Serialize};

/// Command names shared by all flavours.
pub const CMD_INFO: &str = "info";
pub const CMD_EXECUTE: &str = "execute";
pub const CMD_CLEANUP: &str = "cleanup";

/// Symbol names for the dynamic-module flavour.
pub const SYM_INFO: &[u8] = b"riposte_plugin_info";
pub const SYM_EXECUTE: &[u8] = b"riposte_plugin_execute";
pub const SYM_CLEANUP: &[u8] = b"riposte_plugin_cleanup";
/// Optional: frees strings returned by info/execute.
pub const SYM_FREE: &[u8] = b"riposte_plugin_free";

/// Self-reported plugin metadata, returned by the `info` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Dynamic modules declare whether concurrent execution is safe;
    /// absent means no, and calls are serialised.
    #[serde(default)]
    pub reentrant: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_minimal_json() {
        let info: PluginInfo = serde_json::from_str(r#"{"name": "geoip"}"#).unwrap();
        assert_eq!(info.name, "geoip");
        assert!(!info.reentrant);
        assert!(info.version.is_none());
    }
}
