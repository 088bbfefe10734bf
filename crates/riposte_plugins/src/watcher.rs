//! Filesystem watcher driving hot reload.

use crate::host::PluginHost;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Keeps the watcher (and its event thread) alive.
pub struct PluginWatcher {
    _watcher: RecommendedWatcher,
}

/// Watch the host's plugin directory; create/modify events reload the
/// touched plugin, remove events unload it.
pub fn watch(host: Arc<PluginHost>, plugins_dir: &Path) -> notify::Result<PluginWatcher> {
    let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
    let mut watcher = notify::recommended_watcher(tx)?;
    watcher.watch(plugins_dir, RecursiveMode::NonRecursive)?;

    std::thread::Builder::new()
        .name("plugin-watcher".to_string())
        .spawn(move || {
            for event in rx {
                match event {
                    Ok(event) => handle_event(&host, event),
                    Err(e) => warn!("plugin watch error: {}", e),
                }
            }
            debug!("plugin watcher channel closed");
        })
        .expect("spawning the watcher thread cannot fail");

    Ok(PluginWatcher { _watcher: watcher })
}

fn handle_event(host: &PluginHost, event: Event) {
    let removed = matches!(event.kind, EventKind::Remove(_));
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return;
    }
    for path in event.paths {
        debug!(path = %path.display(), removed, "plugin file event");
        host.handle_path_change(&path, removed);
    }
}
