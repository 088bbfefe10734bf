//! Plugin registry records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// How a plugin is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginFlavour {
    /// Standalone executable, invoked directly
    Executable,
    /// Script run through the configured interpreter
    Script,
    /// Shared library loaded into the server process
    Dynamic,
}

impl PluginFlavour {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginFlavour::Executable => "executable",
            PluginFlavour::Script => "script",
            PluginFlavour::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for PluginFlavour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Plugin lifecycle status in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Loaded,
    Failed,
    Unloaded,
}

impl PluginStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginStatus::Loaded => "loaded",
            PluginStatus::Failed => "failed",
            PluginStatus::Unloaded => "unloaded",
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Registry entry for a discovered plugin.
///
/// Name is derived from the filename stem and must match the plugin's
/// self-reported name; a mismatch marks the record failed but keeps it
/// visible for debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRecord {
    pub name: String,
    pub flavour: PluginFlavour,
    pub path: String,
    pub status: PluginStatus,
    pub loaded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reloaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PluginRecord {
    pub fn new(name: impl Into<String>, flavour: PluginFlavour, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flavour,
            path: path.into(),
            status: PluginStatus::Loaded,
            loaded_at: Utc::now(),
            reloaded_at: None,
            config: Map::new(),
            last_error: None,
        }
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = PluginStatus::Failed;
        self.last_error = Some(error.into());
    }

    pub fn mark_reloaded(&mut self) {
        self.status = PluginStatus::Loaded;
        self.reloaded_at = Some(Utc::now());
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flavour_serde_lowercase() {
        let json = serde_json::to_string(&PluginFlavour::Dynamic).unwrap();
        assert_eq!(json, r#""dynamic""#);
    }

    #[test]
    fn test_record_failure_keeps_entry() {
        let mut record = PluginRecord::new("geoip", PluginFlavour::Executable, "/plugins/geoip");
        record.mark_failed("name mismatch");
        assert_eq!(record.status, PluginStatus::Failed);
        assert_eq!(record.last_error.as_deref(), Some("name mismatch"));

        record.mark_reloaded();
        assert_eq!(record.status, PluginStatus::Loaded);
        assert!(record.last_error.is_none());
        assert!(record.reloaded_at.is_some());
    }
}
