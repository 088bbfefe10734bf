//! Automation script runner.
//!
//! Implements the engine's [`riposte_engine::ScriptRunner`] seam by
//! spawning external interpreters with a strict protocol: one JSON
//! document in, one JSON object on stdout out, stderr reserved for
//! logging.

pub mod interp;
pub mod launcher;
pub mod runner;

pub use interp::{resolve_interpreter, venv_interpreter};
pub use launcher::{ArgStyle, LaunchOutput, LaunchSpec, ProcessLauncher, ScriptLauncher};
pub use runner::{AutomationRunner, RunnerConfig};
