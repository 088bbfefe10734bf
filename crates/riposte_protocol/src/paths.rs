//! Default on-disk locations for Riposte state.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Once;

static CREATE_DIR_WARNED: Once = Once::new();

/// Resolve the Riposte home directory.
///
/// Priority:
/// 1) RIPOSTE_HOME
/// 2) HOME/USERPROFILE
/// 3) ./.riposte
pub fn riposte_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("RIPOSTE_HOME") {
        return PathBuf::from(override_path);
    }
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        return PathBuf::from(home).join(".riposte");
    }
    PathBuf::from(".").join(".riposte")
}

fn ensure_home_dir(home: &PathBuf) {
    if let Err(err) = std::fs::create_dir_all(home) {
        CREATE_DIR_WARNED.call_once(|| {
            eprintln!(
                "Warning: failed to create Riposte home directory {}: {}. Set RIPOSTE_HOME or pass --data-dir.",
                home.display(),
                err
            );
        });
    }
}

/// Default data directory: ~/.riposte/data
pub fn default_data_dir() -> PathBuf {
    let home = riposte_home();
    ensure_home_dir(&home);
    home.join("data")
}

/// Default logs directory: ~/.riposte/logs
pub fn default_logs_dir() -> PathBuf {
    let home = riposte_home();
    ensure_home_dir(&home);
    home.join("logs")
}

/// Job store file inside a data directory: data/jobs.json
pub fn jobs_file(data_dir: &Path) -> PathBuf {
    data_dir.join("jobs.json")
}

/// Sqlite job store inside a data directory: data/jobs.db
pub fn jobs_db(data_dir: &Path) -> PathBuf {
    data_dir.join("jobs.db")
}

/// Encrypted integration config vault: data/integration_configs.enc
pub fn vault_file(data_dir: &Path) -> PathBuf {
    data_dir.join("integration_configs.enc")
}

/// Backup sibling for a store file, suffixed with a compact UTC timestamp.
pub fn backup_path(store_path: &Path, at: DateTime<Utc>) -> PathBuf {
    let name = store_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    let stamped = format!("{}.backup.{}", name, at.format("%Y%m%dT%H%M%SZ"));
    store_path.with_file_name(stamped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_backup_path_suffix() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let path = backup_path(Path::new("/data/jobs.json"), at);
        assert_eq!(
            path,
            PathBuf::from("/data/jobs.json.backup.20260314T092653Z")
        );
    }
}
