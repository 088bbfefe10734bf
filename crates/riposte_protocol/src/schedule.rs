//! Cron-style schedule records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A recurring trigger that materialises jobs from a playbook reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    /// Cron expression (seconds-resolution, standard 6/7 field form).
    pub cron: String,
    /// Name of the playbook to run, resolved through the playbook library.
    pub playbook: String,
    /// Template for the job context; cloned per firing.
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl Schedule {
    pub fn new(id: impl Into<String>, cron: impl Into<String>, playbook: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cron: cron.into(),
            playbook: playbook.into(),
            context: Map::new(),
            enabled: true,
            next_fire: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_defaults_true() {
        let schedule: Schedule = serde_json::from_str(
            r#"{"id":"s1","cron":"0 * * * * *","playbook":"triage"}"#,
        )
        .unwrap();
        assert!(schedule.enabled);
        assert!(schedule.context.is_empty());
    }
}
