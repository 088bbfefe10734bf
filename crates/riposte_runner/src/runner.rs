//! The automation runner: scripts in, cleaned JSON out.
//!
//! Protocol with the child process:
//! 1. The merged params+context document is serialized as one JSON
//!    value and handed over as a single argument (or stdin).
//! 2. stdout must be a JSON object; stderr is logging and never
//!    reaches the result.
//! 3. If stdout fails to parse, everything before the first `{` and
//!    after the last `}` is stripped and parsing retried once.

use crate::launcher::{ArgStyle, LaunchSpec, ProcessLauncher, ScriptLauncher};
use riposte_engine::{ScriptError, ScriptRunner};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for the automation runner (plain data).
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub scripts_dir: PathBuf,
    pub interpreter: PathBuf,
    pub timeout: Duration,
    pub arg_style: ArgStyle,
}

/// Runs automation scripts through the configured interpreter.
pub struct AutomationRunner {
    config: RunnerConfig,
    launcher: Box<dyn ScriptLauncher>,
}

impl AutomationRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            launcher: Box::new(ProcessLauncher),
        }
    }

    /// Swap the launcher; used by tests to avoid real subprocesses.
    pub fn with_launcher(config: RunnerConfig, launcher: Box<dyn ScriptLauncher>) -> Self {
        Self { config, launcher }
    }

    fn script_path(&self, name: &str) -> Result<PathBuf, ScriptError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(ScriptError::Launch {
                script: name.to_string(),
                message: "invalid script name".to_string(),
            });
        }
        let mut path = self.config.scripts_dir.join(name);
        if path.extension().is_none() {
            path.set_extension("py");
        }
        if !path.exists() {
            return Err(ScriptError::Launch {
                script: name.to_string(),
                message: format!("script not found at {}", path.display()),
            });
        }
        Ok(path)
    }
}

impl ScriptRunner for AutomationRunner {
    fn run(
        &self,
        script: &str,
        payload: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ScriptError> {
        let program = self.script_path(script)?;
        let payload_json =
            serde_json::to_string(&Value::Object(payload.clone())).map_err(|e| {
                ScriptError::Launch {
                    script: script.to_string(),
                    message: format!("failed to serialize payload: {}", e),
                }
            })?;

        let spec = LaunchSpec {
            interpreter: Some(self.config.interpreter.clone()),
            program,
            args: Vec::new(),
            payload: Some(payload_json),
            arg_style: self.config.arg_style,
            timeout: self.config.timeout,
        };

        let output = self.launcher.launch(&spec).map_err(|e| ScriptError::Launch {
            script: script.to_string(),
            message: e.to_string(),
        })?;

        if output.timed_out {
            return Err(ScriptError::Timeout {
                script: script.to_string(),
                seconds: self.config.timeout.as_secs(),
            });
        }

        if output.exit_code != Some(0) {
            return Err(ScriptError::Failed {
                script: script.to_string(),
                message: format!(
                    "exit code {:?}: {}",
                    output.exit_code,
                    output.stderr_tail.trim()
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(script, bytes = stdout.len(), "script completed");
        parse_result(script, &stdout)
    }
}

/// Parse stdout into a result object. Whitespace-only stdout (the
/// script logged to stderr and reported nothing) is an empty result,
/// not an error.
pub fn parse_result(script: &str, stdout: &str) -> Result<Map<String, Value>, ScriptError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Map::new());
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => return Ok(map),
        Ok(other) => {
            return Err(ScriptError::OutputInvalid {
                script: script.to_string(),
                message: format!("expected a JSON object, got {}", kind(&other)),
            })
        }
        Err(_) => {}
    }

    // Scripts sometimes print banners around the JSON document; strip
    // to the outermost braces and retry once.
    let cleaned = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => {
            return Err(ScriptError::OutputInvalid {
                script: script.to_string(),
                message: "stdout contains no JSON object".to_string(),
            })
        }
    };
    warn!(
        script,
        "stdout was not clean JSON; stripped to outermost braces"
    );

    match serde_json::from_str::<Value>(cleaned) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ScriptError::OutputInvalid {
            script: script.to_string(),
            message: format!("expected a JSON object, got {}", kind(&other)),
        }),
        Err(e) => Err(ScriptError::OutputInvalid {
            script: script.to_string(),
            message: e.to_string(),
        }),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::LaunchOutput;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    struct CannedLauncher {
        output: Mutex<Option<LaunchOutput>>,
        seen_payload: Arc<Mutex<Option<String>>>,
    }

    impl CannedLauncher {
        fn new(output: LaunchOutput) -> Self {
            Self {
                output: Mutex::new(Some(output)),
                seen_payload: Arc::new(Mutex::new(None)),
            }
        }
    }

    impl ScriptLauncher for CannedLauncher {
        fn launch(&self, spec: &LaunchSpec) -> std::io::Result<LaunchOutput> {
            *self.seen_payload.lock().unwrap() = spec.payload.clone();
            Ok(self.output.lock().unwrap().take().expect("single launch"))
        }
    }

    fn runner_with(dir: &std::path::Path, output: LaunchOutput) -> AutomationRunner {
        AutomationRunner::with_launcher(
            RunnerConfig {
                scripts_dir: dir.to_path_buf(),
                interpreter: PathBuf::from("/usr/bin/python3"),
                timeout: Duration::from_secs(300),
                arg_style: ArgStyle::Argument,
            },
            Box::new(CannedLauncher::new(output)),
        )
    }

    fn ok_output(stdout: &str) -> LaunchOutput {
        LaunchOutput {
            stdout: stdout.as_bytes().to_vec(),
            stderr_tail: String::new(),
            exit_code: Some(0),
            timed_out: false,
        }
    }

    fn touch_script(dir: &std::path::Path, name: &str) {
        std::fs::write(dir.join(name), "").unwrap();
    }

    #[test]
    fn test_run_parses_stdout_object() {
        let dir = tempfile::tempdir().unwrap();
        touch_script(dir.path(), "hello.py");
        let runner = runner_with(dir.path(), ok_output(r#"{"greeting": "world"}"#));

        let result = runner.run("hello", &Map::new()).unwrap();
        assert_eq!(result.get("greeting"), Some(&json!("world")));
    }

    #[test]
    fn test_run_serializes_payload_for_child() {
        let dir = tempfile::tempdir().unwrap();
        touch_script(dir.path(), "hello.py");
        let launcher = CannedLauncher::new(ok_output("{}"));
        let seen = Arc::clone(&launcher.seen_payload);

        let runner = AutomationRunner::with_launcher(
            RunnerConfig {
                scripts_dir: dir.path().to_path_buf(),
                interpreter: PathBuf::from("python3"),
                timeout: Duration::from_secs(1),
                arg_style: ArgStyle::Argument,
            },
            Box::new(launcher),
        );

        let mut payload = Map::new();
        payload.insert("name".to_string(), json!("world"));
        runner.run("hello", &payload).unwrap();

        let sent = seen.lock().unwrap().clone().expect("payload delivered");
        assert_eq!(sent, r#"{"name":"world"}"#);
    }

    #[test]
    fn test_nonzero_exit_is_script_failed() {
        let dir = tempfile::tempdir().unwrap();
        touch_script(dir.path(), "boom.py");
        let runner = runner_with(
            dir.path(),
            LaunchOutput {
                stdout: Vec::new(),
                stderr_tail: "Traceback: ...".to_string(),
                exit_code: Some(2),
                timed_out: false,
            },
        );

        let err = runner.run("boom", &Map::new()).unwrap_err();
        match err {
            ScriptError::Failed { message, .. } => assert!(message.contains("Traceback")),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_timeout_maps_to_script_timeout() {
        let dir = tempfile::tempdir().unwrap();
        touch_script(dir.path(), "slow.py");
        let runner = runner_with(
            dir.path(),
            LaunchOutput {
                stdout: Vec::new(),
                stderr_tail: String::new(),
                exit_code: None,
                timed_out: true,
            },
        );

        assert!(matches!(
            runner.run("slow", &Map::new()),
            Err(ScriptError::Timeout { .. })
        ));
    }

    #[test]
    fn test_missing_script_fails_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with(dir.path(), ok_output("{}"));
        assert!(matches!(
            runner.run("ghost", &Map::new()),
            Err(ScriptError::Launch { .. })
        ));
    }

    #[test]
    fn test_script_name_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with(dir.path(), ok_output("{}"));
        for name in ["../evil", "a/b", ".hidden"] {
            assert!(runner.run(name, &Map::new()).is_err(), "accepted '{name}'");
        }
    }

    mod output_cleaning {
        use super::*;

        #[test]
        fn test_clean_json_passes_through() {
            let result = parse_result("s", r#"{"a": 1}"#).unwrap();
            assert_eq!(result.get("a"), Some(&json!(1)));
        }

        #[test]
        fn test_banner_noise_stripped() {
            let noisy = "Initializing...\n{\"a\": 1}\nDone.";
            let result = parse_result("s", noisy).unwrap();
            assert_eq!(result.get("a"), Some(&json!(1)));
        }

        #[test]
        fn test_empty_stdout_is_empty_result() {
            assert!(parse_result("s", "").unwrap().is_empty());
            assert!(parse_result("s", "  \n").unwrap().is_empty());
        }

        #[test]
        fn test_non_object_json_rejected() {
            assert!(matches!(
                parse_result("s", "[1, 2]"),
                Err(ScriptError::OutputInvalid { .. })
            ));
            assert!(matches!(
                parse_result("s", "42"),
                Err(ScriptError::OutputInvalid { .. })
            ));
        }

        #[test]
        fn test_garbage_rejected_after_cleaning() {
            assert!(matches!(
                parse_result("s", "no json here"),
                Err(ScriptError::OutputInvalid { .. })
            ));
            assert!(matches!(
                parse_result("s", "{broken"),
                Err(ScriptError::OutputInvalid { .. })
            ));
        }
    }
}
