//! Dynamic-module plugin flavour.
//!
//! Loaded with `libloading` on platforms that support it; elsewhere the
//! host silently discovers zero dynamic plugins. The module contract is
//! three C symbols returning NUL-terminated UTF-8 JSON:
//!
//! ```c
//! const char *riposte_plugin_info(void);
//! const char *riposte_plugin_execute(const char *params_json);
//! void riposte_plugin_cleanup(void);
//! void riposte_plugin_free(const char *);  /* optional */
//! ```
//!
//! Returned strings are copied immediately; if the module exports
//! `riposte_plugin_free`, it is called with the original pointer.

use riposte_engine::PluginError;
use std::path::Path;

#[cfg(any(unix, windows))]
mod imp {
    use super::*;
    use crate::contract::{SYM_CLEANUP, SYM_EXECUTE, SYM_FREE, SYM_INFO};
    use libloading::{Library, Symbol};
    use std::ffi::{c_char, CStr, CString};
    use tracing::warn;

    type InfoFn = unsafe extern "C" fn() -> *const c_char;
    type ExecuteFn = unsafe extern "C" fn(*const c_char) -> *const c_char;
    type CleanupFn = unsafe extern "C" fn();
    type FreeFn = unsafe extern "C" fn(*const c_char);

    /// A loaded dynamic module. The library stays resident for the
    /// lifetime of this value, so executions holding a clone of the
    /// handle complete against the old code across a reload.
    pub struct DynamicPlugin {
        name: String,
        library: Library,
    }

    impl DynamicPlugin {
        pub fn load(name: &str, path: &Path) -> Result<Self, PluginError> {
            // Safety: the deployment model trusts on-disk plugin assets.
            let library = unsafe { Library::new(path) }.map_err(|e| PluginError::Load {
                plugin: name.to_string(),
                message: e.to_string(),
            })?;
            Ok(Self {
                name: name.to_string(),
                library,
            })
        }

        pub fn info_json(&self) -> Result<String, PluginError> {
            unsafe {
                let info: Symbol<InfoFn> =
                    self.library.get(SYM_INFO).map_err(|e| PluginError::Load {
                        plugin: self.name.clone(),
                        message: format!("missing info symbol: {}", e),
                    })?;
                self.copy_and_free(info())
            }
        }

        pub fn execute_json(&self, params: &str) -> Result<String, PluginError> {
            let params = CString::new(params).map_err(|_| PluginError::ExecFailed {
                plugin: self.name.clone(),
                message: "params contain interior NUL".to_string(),
            })?;
            unsafe {
                let execute: Symbol<ExecuteFn> =
                    self.library
                        .get(SYM_EXECUTE)
                        .map_err(|e| PluginError::Load {
                            plugin: self.name.clone(),
                            message: format!("missing execute symbol: {}", e),
                        })?;
                self.copy_and_free(execute(params.as_ptr()))
            }
        }

        pub fn cleanup(&self) {
            unsafe {
                match self.library.get::<CleanupFn>(SYM_CLEANUP) {
                    Ok(cleanup) => cleanup(),
                    Err(e) => warn!(plugin = %self.name, "no cleanup symbol: {}", e),
                }
            }
        }

        /// Copy a returned C string, then hand the pointer back to the
        /// module's free function when it exports one.
        unsafe fn copy_and_free(&self, ptr: *const c_char) -> Result<String, PluginError> {
            if ptr.is_null() {
                return Err(PluginError::ExecFailed {
                    plugin: self.name.clone(),
                    message: "plugin returned a null pointer".to_string(),
                });
            }
            let copied = CStr::from_ptr(ptr).to_string_lossy().into_owned();
            if let Ok(free) = self.library.get::<FreeFn>(SYM_FREE) {
                free(ptr);
            }
            Ok(copied)
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod imp {
    use super::*;

    /// Stub for platforms without dynamic loading; never constructed
    /// because discovery skips dynamic-module files there.
    pub struct DynamicPlugin;

    impl DynamicPlugin {
        pub fn load(name: &str, _path: &Path) -> Result<Self, PluginError> {
            Err(PluginError::Load {
                plugin: name.to_string(),
                message: "dynamic modules are not supported on this platform".to_string(),
            })
        }

        pub fn info_json(&self) -> Result<String, PluginError> {
            unreachable!("stub plugin cannot be constructed")
        }

        pub fn execute_json(&self, _params: &str) -> Result<String, PluginError> {
            unreachable!("stub plugin cannot be constructed")
        }

        pub fn cleanup(&self) {}
    }
}

pub use imp::DynamicPlugin;

/// Whether this build can load dynamic-module plugins at all.
pub const fn dynamic_loading_supported() -> bool {
    cfg!(any(unix, windows))
}
