//! Error types for playbook evaluation.
//!
//! The script and plugin error enums double as the contract for the
//! collaborator seams in [`crate::traits`]: implementations in other
//! crates return these types so the evaluator can branch on the kind
//! without knowing how the work was performed.

use thiserror::Error;

/// Evaluation result type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the rule evaluator.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed playbook: unknown operation key, non-array top level,
    /// wrong operand shapes.
    #[error("invalid playbook: {0}")]
    ValidationFailed(String),

    /// A `var` path did not resolve.
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// Comparison or logical operation on inappropriate operands.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Failure positioned at a top-level rule.
    #[error("rule {index} failed: {source}")]
    Rule {
        index: usize,
        #[source]
        source: Box<EngineError>,
    },

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// The job was cancelled before evaluation began.
    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationFailed(msg.into())
    }

    /// Attach the index of the top-level rule that failed.
    pub fn at_rule(self, index: usize) -> Self {
        match self {
            already @ EngineError::Rule { .. } => already,
            other => EngineError::Rule {
                index,
                source: Box::new(other),
            },
        }
    }
}

/// Automation script subprocess failures.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// Non-zero exit code.
    #[error("script '{script}' failed: {message}")]
    Failed { script: String, message: String },

    /// Deadline exceeded; the child process was killed.
    #[error("script '{script}' timed out after {seconds}s")]
    Timeout { script: String, seconds: u64 },

    /// stdout was not parseable as JSON even after cleaning.
    #[error("script '{script}' produced invalid output: {message}")]
    OutputInvalid { script: String, message: String },

    /// The interpreter or script could not be started.
    #[error("failed to launch script '{script}': {message}")]
    Launch { script: String, message: String },
}

/// Plugin host failures.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin '{0}' not found")]
    NotFound(String),

    /// Self-reported name differs from the filename stem.
    #[error("plugin '{expected}' reports name '{reported}'")]
    NameMismatch { expected: String, reported: String },

    #[error("plugin '{plugin}' execution failed: {message}")]
    ExecFailed { plugin: String, message: String },

    /// stdout exceeded the configured cap.
    #[error("plugin '{plugin}' output exceeded {limit} bytes")]
    OutputTooLarge { plugin: String, limit: usize },

    #[error("failed to load plugin '{plugin}': {message}")]
    Load { plugin: String, message: String },
}
