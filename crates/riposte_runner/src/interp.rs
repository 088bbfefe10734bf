//! Interpreter resolution for automation scripts.
//!
//! Automations typically run under a virtual-environment-scoped Python
//! so their dependencies stay pinned. Resolution order: the configured
//! path, the venv's interpreter, then PATH.

use std::path::{Path, PathBuf};

/// Interpreter inside a virtual environment directory.
pub fn venv_interpreter(venv_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        venv_dir.join("Scripts/python.exe")
    } else {
        venv_dir.join("bin/python")
    }
}

/// Resolve the interpreter for automation scripts.
///
/// Returns an error naming everything that was tried, so a
/// misconfigured deployment fails loudly at startup rather than on the
/// first job.
pub fn resolve_interpreter(
    configured: Option<&Path>,
    venv_dir: Option<&Path>,
) -> Result<PathBuf, String> {
    let mut tried = Vec::new();

    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        tried.push(path.display().to_string());
    }

    if let Some(venv) = venv_dir {
        let candidate = venv_interpreter(venv);
        if candidate.exists() {
            return Ok(candidate);
        }
        tried.push(candidate.display().to_string());
    }

    for name in ["python3", "python"] {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
        tried.push(name.to_string());
    }

    Err(format!(
        "no usable python interpreter found (tried: {})",
        tried.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("python");
        std::fs::write(&fake, "").unwrap();

        let resolved = resolve_interpreter(Some(&fake), None).unwrap();
        assert_eq!(resolved, fake);
    }

    #[test]
    fn test_venv_layout() {
        let venv = Path::new("/opt/venv");
        let interp = venv_interpreter(venv);
        if cfg!(windows) {
            assert!(interp.ends_with("Scripts/python.exe"));
        } else {
            assert!(interp.ends_with("bin/python"));
        }
    }

    #[test]
    fn test_missing_configured_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        let venv = dir.path().join("venv");
        let bin = venv.join(if cfg!(windows) { "Scripts" } else { "bin" });
        std::fs::create_dir_all(&bin).unwrap();
        let interp = venv_interpreter(&venv);
        std::fs::write(&interp, "").unwrap();

        let resolved =
            resolve_interpreter(Some(Path::new("/does/not/exist")), Some(&venv)).unwrap();
        assert_eq!(resolved, interp);
    }
}
