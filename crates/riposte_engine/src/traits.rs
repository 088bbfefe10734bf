//! Collaborator seams consumed by the evaluator.
//!
//! The evaluator is synchronous; implementations block on child
//! process I/O and are driven from a blocking thread pool by the job
//! manager.

use crate::error::{EngineError, PluginError, Result, ScriptError};
use serde_json::{Map, Value};

/// Executes automation scripts: the payload is the merged
/// params-over-context document, the return value the parsed and
/// cleaned JSON object from stdout. The caller owns merging the result
/// into its context.
pub trait ScriptRunner: Send + Sync {
    fn run(&self, script: &str, payload: &Map<String, Value>)
        -> std::result::Result<Map<String, Value>, ScriptError>;
}

/// Executes plugins by name with a merged parameter document.
pub trait PluginInvoker: Send + Sync {
    fn execute(
        &self,
        plugin: &str,
        params: &Map<String, Value>,
    ) -> std::result::Result<Value, PluginError>;
}

/// Resolves named playbooks for the `play` operation.
pub trait PlaybookSource: Send + Sync {
    fn load(&self, name: &str) -> Result<Vec<Value>>;
}

/// A playbook source with nothing in it; loads always fail.
#[derive(Debug, Default)]
pub struct EmptyPlaybookSource;

impl PlaybookSource for EmptyPlaybookSource {
    fn load(&self, name: &str) -> Result<Vec<Value>> {
        Err(EngineError::validation(format!(
            "unknown playbook '{}'",
            name
        )))
    }
}
