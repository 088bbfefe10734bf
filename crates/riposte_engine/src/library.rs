//! Directory-backed playbook library.

use crate::error::{EngineError, Result};
use crate::traits::PlaybookSource;
use serde_json::Value;
use std::path::PathBuf;
use tracing::debug;

/// Loads named playbooks from `<dir>/<name>.json` on every call, so
/// edited playbooks take effect without a restart.
pub struct DirLibrary {
    dir: PathBuf,
}

impl DirLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Names of all playbooks currently on disk.
    pub fn names(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|x| x.to_str()) == Some("json") {
                    path.file_stem().map(|s| s.to_string_lossy().into_owned())
                } else {
                    None
                }
            })
            .collect();
        names.sort();
        names
    }
}

impl PlaybookSource for DirLibrary {
    fn load(&self, name: &str) -> Result<Vec<Value>> {
        // Reject anything that could escape the playbook directory
        if name.is_empty() || name.contains(['/', '\\', '.']) {
            return Err(EngineError::validation(format!(
                "invalid playbook name '{}'",
                name
            )));
        }

        let path = self.dir.join(format!("{}.json", name));
        let raw = std::fs::read_to_string(&path).map_err(|_| {
            EngineError::validation(format!("unknown playbook '{}'", name))
        })?;

        let parsed: Value = serde_json::from_str(&raw).map_err(|e| {
            EngineError::validation(format!("playbook '{}' is not valid JSON: {}", name, e))
        })?;

        match parsed {
            Value::Array(nodes) => {
                debug!(playbook = name, rules = nodes.len(), "loaded playbook");
                Ok(nodes)
            }
            other => Err(EngineError::validation(format!(
                "playbook '{}' must be a JSON array, got {}",
                name,
                match other {
                    Value::Object(_) => "object",
                    _ => "scalar",
                }
            ))),
        }
    }
}
