//! The plugin host: discovery, execution, and reload.
//!
//! One registry, one record shape, with the flavour field selecting
//! the dispatcher. Executions clone the handler out of the registry
//! lock before running, so in-flight work completes against the old
//! code while a reload swaps the entry underneath.

use crate::contract::{PluginInfo, CMD_CLEANUP, CMD_EXECUTE, CMD_INFO};
use crate::dynamic::{dynamic_loading_supported, DynamicPlugin};
use riposte_engine::{PluginError, PluginInvoker};
use riposte_protocol::defaults::MAX_PLUGIN_OUTPUT_BYTES;
use riposte_protocol::{PluginFlavour, PluginRecord, PluginStatus};
use riposte_runner::runner::parse_result;
use riposte_runner::{ArgStyle, LaunchSpec, ProcessLauncher, ScriptLauncher};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// Plugin host configuration (plain data).
#[derive(Debug, Clone)]
pub struct PluginHostConfig {
    pub plugins_dir: PathBuf,
    /// Interpreter for the interpreted-script flavour.
    pub interpreter: PathBuf,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl PluginHostConfig {
    pub fn new(plugins_dir: impl Into<PathBuf>, interpreter: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            interpreter: interpreter.into(),
            timeout: Duration::from_secs(60),
            max_output_bytes: MAX_PLUGIN_OUTPUT_BYTES,
        }
    }
}

/// Flavour-specific dispatch handle.
enum Handler {
    Cli {
        interpreter: Option<PathBuf>,
        path: PathBuf,
    },
    Dynamic {
        module: DynamicPlugin,
        reentrant: bool,
        gate: Mutex<()>,
    },
}

struct Entry {
    record: PluginRecord,
    handler: Option<Arc<Handler>>,
}

/// Discovers, loads, executes, and hot-reloads plugins.
pub struct PluginHost {
    config: PluginHostConfig,
    registry: RwLock<HashMap<String, Entry>>,
    launcher: Box<dyn ScriptLauncher>,
}

impl PluginHost {
    pub fn new(config: PluginHostConfig) -> Self {
        Self {
            config,
            registry: RwLock::new(HashMap::new()),
            launcher: Box::new(ProcessLauncher),
        }
    }

    /// Swap the launcher; used by tests to avoid real subprocesses.
    pub fn with_launcher(config: PluginHostConfig, launcher: Box<dyn ScriptLauncher>) -> Self {
        Self {
            config,
            registry: RwLock::new(HashMap::new()),
            launcher,
        }
    }

    /// Scan the plugins directory and (re)load everything recognised.
    pub fn scan(&self) {
        let Ok(entries) = std::fs::read_dir(&self.config.plugins_dir) else {
            warn!(
                dir = %self.config.plugins_dir.display(),
                "plugins directory not readable; loading zero plugins"
            );
            return;
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if let Some(flavour) = flavour_for_path(&path) {
                self.load_path(&path, flavour);
            }
        }

        let count = self.registry.read().map(|r| r.len()).unwrap_or(0);
        info!(count, "plugin scan complete");
    }

    /// React to a filesystem change under the plugins directory.
    pub fn handle_path_change(&self, path: &Path, removed: bool) {
        let Some(name) = stem_of(path) else { return };

        if removed {
            self.unload(&name);
            return;
        }
        if let Some(flavour) = flavour_for_path(path) {
            let known = self
                .registry
                .read()
                .ok()
                .map(|r| r.contains_key(&name))
                .unwrap_or(false);
            if known {
                info!(plugin = %name, "reloading changed plugin");
                self.cleanup_one(&name);
            }
            self.load_path(path, flavour);
        }
    }

    /// Load or reload a single plugin file.
    fn load_path(&self, path: &Path, flavour: PluginFlavour) {
        let Some(name) = stem_of(path) else { return };

        let previous = self
            .registry
            .read()
            .ok()
            .and_then(|r| r.get(&name).map(|e| e.record.clone()));

        let (handler, load_error) = self.build_handler(&name, path, flavour);
        let mut record = match previous {
            Some(mut record) => {
                record.flavour = flavour;
                record.path = path.display().to_string();
                record.mark_reloaded();
                record
            }
            None => PluginRecord::new(name.clone(), flavour, path.display().to_string()),
        };
        record.config = load_sibling_config(path);

        let handler = match (handler, load_error) {
            (Some(handler), None) => {
                // Verify the self-reported name against the filename stem
                match self.query_info(&name, &handler) {
                    Ok(info) if info.name != name => {
                        let err = PluginError::NameMismatch {
                            expected: name.clone(),
                            reported: info.name,
                        };
                        warn!(plugin = %name, "{}", err);
                        record.mark_failed(err.to_string());
                        Some(Arc::new(handler))
                    }
                    Ok(_) => Some(Arc::new(handler)),
                    Err(e) => {
                        warn!(plugin = %name, "info query failed: {}", e);
                        record.mark_failed(e.to_string());
                        Some(Arc::new(handler))
                    }
                }
            }
            (_, error) => {
                let message = error.unwrap_or_else(|| "unknown load failure".to_string());
                warn!(plugin = %name, "load failed: {}", message);
                record.mark_failed(message);
                None
            }
        };

        if let Ok(mut registry) = self.registry.write() {
            registry.insert(name, Entry { record, handler });
        }
    }

    fn build_handler(
        &self,
        name: &str,
        path: &Path,
        flavour: PluginFlavour,
    ) -> (Option<Handler>, Option<String>) {
        match flavour {
            PluginFlavour::Executable => (
                Some(Handler::Cli {
                    interpreter: None,
                    path: path.to_path_buf(),
                }),
                None,
            ),
            PluginFlavour::Script => (
                Some(Handler::Cli {
                    interpreter: Some(self.config.interpreter.clone()),
                    path: path.to_path_buf(),
                }),
                None,
            ),
            PluginFlavour::Dynamic => match DynamicPlugin::load(name, path) {
                Ok(module) => {
                    let reentrant = module
                        .info_json()
                        .ok()
                        .and_then(|json| serde_json::from_str::<PluginInfo>(&json).ok())
                        .map(|info| info.reentrant)
                        .unwrap_or(false);
                    (
                        Some(Handler::Dynamic {
                            module,
                            reentrant,
                            gate: Mutex::new(()),
                        }),
                        None,
                    )
                }
                Err(e) => (None, Some(e.to_string())),
            },
        }
    }

    fn query_info(&self, name: &str, handler: &Handler) -> Result<PluginInfo, PluginError> {
        let raw = match handler {
            Handler::Cli { interpreter, path } => {
                self.cli_command(name, interpreter.as_deref(), path, CMD_INFO, None)?
            }
            Handler::Dynamic { module, .. } => module.info_json()?,
        };
        serde_json::from_str(&raw).map_err(|e| PluginError::Load {
            plugin: name.to_string(),
            message: format!("info is not valid JSON: {}", e),
        })
    }

    fn cli_command(
        &self,
        name: &str,
        interpreter: Option<&Path>,
        path: &Path,
        command: &str,
        payload: Option<String>,
    ) -> Result<String, PluginError> {
        let spec = LaunchSpec {
            interpreter: interpreter.map(Path::to_path_buf),
            program: path.to_path_buf(),
            args: vec![command.to_string()],
            payload,
            arg_style: ArgStyle::Argument,
            timeout: self.config.timeout,
        };
        let output = self
            .launcher
            .launch(&spec)
            .map_err(|e| PluginError::ExecFailed {
                plugin: name.to_string(),
                message: e.to_string(),
            })?;

        if output.timed_out {
            return Err(PluginError::ExecFailed {
                plugin: name.to_string(),
                message: format!("'{}' timed out after {}s", command, self.config.timeout.as_secs()),
            });
        }
        if output.exit_code != Some(0) {
            return Err(PluginError::ExecFailed {
                plugin: name.to_string(),
                message: format!(
                    "'{}' exited with {:?}: {}",
                    command,
                    output.exit_code,
                    output.stderr_tail.trim()
                ),
            });
        }
        if output.stdout.len() > self.config.max_output_bytes {
            return Err(PluginError::OutputTooLarge {
                plugin: name.to_string(),
                limit: self.config.max_output_bytes,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run `cleanup` on one plugin, best-effort.
    fn cleanup_one(&self, name: &str) {
        let handler = self
            .registry
            .read()
            .ok()
            .and_then(|r| r.get(name).and_then(|e| e.handler.clone()));
        let Some(handler) = handler else { return };

        match handler.as_ref() {
            Handler::Cli { interpreter, path } => {
                if let Err(e) =
                    self.cli_command(name, interpreter.as_deref(), path, CMD_CLEANUP, None)
                {
                    warn!(plugin = %name, "cleanup failed: {}", e);
                }
            }
            Handler::Dynamic { module, .. } => module.cleanup(),
        }
    }

    /// Cleanup and unregister a removed plugin.
    pub fn unload(&self, name: &str) {
        self.cleanup_one(name);
        if let Ok(mut registry) = self.registry.write() {
            if let Some(entry) = registry.get_mut(name) {
                entry.record.status = PluginStatus::Unloaded;
                entry.handler = None;
                info!(plugin = %name, "plugin unloaded");
            }
        }
    }

    /// Run `cleanup` across all loaded plugins (shutdown path).
    pub fn cleanup_all(&self) {
        let names: Vec<String> = self
            .registry
            .read()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        for name in names {
            self.cleanup_one(&name);
        }
    }

    /// Current registry records for listings.
    pub fn records(&self) -> Vec<PluginRecord> {
        let mut records: Vec<PluginRecord> = self
            .registry
            .read()
            .map(|r| r.values().map(|e| e.record.clone()).collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }
}

impl PluginInvoker for PluginHost {
    fn execute(&self, plugin: &str, params: &Map<String, Value>) -> Result<Value, PluginError> {
        let handler = {
            let registry = self.registry.read().map_err(|_| PluginError::ExecFailed {
                plugin: plugin.to_string(),
                message: "plugin registry lock poisoned".to_string(),
            })?;
            let entry = registry
                .get(plugin)
                .ok_or_else(|| PluginError::NotFound(plugin.to_string()))?;
            if entry.record.status != PluginStatus::Loaded {
                return Err(PluginError::ExecFailed {
                    plugin: plugin.to_string(),
                    message: format!(
                        "plugin is {}: {}",
                        entry.record.status,
                        entry.record.last_error.as_deref().unwrap_or("no detail")
                    ),
                });
            }
            entry
                .handler
                .clone()
                .ok_or_else(|| PluginError::NotFound(plugin.to_string()))?
        };

        let params_json = serde_json::to_string(&Value::Object(params.clone())).map_err(|e| {
            PluginError::ExecFailed {
                plugin: plugin.to_string(),
                message: format!("failed to serialize params: {}", e),
            }
        })?;

        let raw = match handler.as_ref() {
            Handler::Cli { interpreter, path } => self.cli_command(
                plugin,
                interpreter.as_deref(),
                path,
                CMD_EXECUTE,
                Some(params_json),
            )?,
            Handler::Dynamic {
                module,
                reentrant,
                gate,
            } => {
                // Non-reentrant modules serialise; a poisoned gate only
                // means a previous call panicked, not that we must too.
                let _guard = if *reentrant {
                    None
                } else {
                    Some(gate.lock().unwrap_or_else(|p| p.into_inner()))
                };
                let out = module.execute_json(&params_json)?;
                if out.len() > self.config.max_output_bytes {
                    return Err(PluginError::OutputTooLarge {
                        plugin: plugin.to_string(),
                        limit: self.config.max_output_bytes,
                    });
                }
                out
            }
        };

        let result = parse_result(plugin, &raw).map_err(|e| PluginError::ExecFailed {
            plugin: plugin.to_string(),
            message: e.to_string(),
        })?;
        Ok(Value::Object(result))
    }
}

/// Flavour by file extension; files the host does not recognise (and
/// `.json` config siblings) are skipped.
pub fn flavour_for_path(path: &Path) -> Option<PluginFlavour> {
    if !path.is_file() {
        return None;
    }
    match path.extension().and_then(|x| x.to_str()) {
        Some("py") => Some(PluginFlavour::Script),
        Some("so") | Some("dylib") | Some("dll") => {
            if dynamic_loading_supported() {
                Some(PluginFlavour::Dynamic)
            } else {
                None
            }
        }
        Some("exe") => Some(PluginFlavour::Executable),
        Some(_) => None,
        None => is_executable(path).then_some(PluginFlavour::Executable),
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

fn stem_of(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

/// Optional `<stem>.json` sibling carrying the plugin's configuration.
fn load_sibling_config(path: &Path) -> Map<String, Value> {
    let sibling = path.with_extension("json");
    if sibling == path {
        return Map::new();
    }
    std::fs::read_to_string(&sibling)
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default()
}
