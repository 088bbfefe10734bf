//! Playbook evaluation engine.
//!
//! The interpreter at the heart of Riposte: a per-job context map
//! ([`context::ContextStore`]), `{{path}}` template substitution
//! ([`template`]), a typed rule DSL ([`rule`]) and its sequential
//! evaluator ([`eval::Evaluator`]). Script and plugin execution are
//! reached through the seams in [`traits`], implemented elsewhere.

pub mod context;
pub mod error;
pub mod eval;
pub mod library;
pub mod rule;
pub mod template;
pub mod traits;

pub use context::{deep_merge, ContextStore};
pub use error::{EngineError, PluginError, Result, ScriptError};
pub use eval::{compare, truthy, Evaluator};
pub use library::DirLibrary;
pub use rule::{parse_playbook, CmpOp, Rule};
pub use traits::{PlaybookSource, PluginInvoker, ScriptRunner};
