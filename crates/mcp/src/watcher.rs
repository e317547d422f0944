//! Filesystem watchers feeding restart and reload commands to the hub.
//!
//! Each watcher observes a single file by watching its parent directory, so
//! editors and build tools that replace the file atomically are still seen.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use {
    notify_debouncer_full::{
        DebounceEventResult, Debouncer, RecommendedCache, new_debouncer,
        notify::{EventKind, RecommendedWatcher, RecursiveMode},
    },
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use crate::{
    config::{McpServerConfig, TransportConfig},
    error::{Context, Result},
};

/// Substring identifying the entry point of a locally built server.
const BUILD_ARTIFACT_MARKER: &str = "build/index.js";

/// Commands produced by watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A stdio server's build artifact changed.
    Restart(String),
    /// The settings file changed.
    SettingsChanged,
}

/// The file whose changes should restart a stdio server: the first argument
/// naming a `build/index.js` entry point, resolved against `cwd`.
pub fn build_artifact(config: &McpServerConfig) -> Option<PathBuf> {
    let TransportConfig::Stdio { args, cwd, .. } = &config.transport else {
        return None;
    };
    let arg = args.iter().find(|a| a.contains(BUILD_ARTIFACT_MARKER))?;
    let path = PathBuf::from(arg);
    match cwd {
        Some(cwd) if path.is_relative() => Some(cwd.join(path)),
        _ => Some(path),
    }
}

/// Debounced watcher on one file. Dropping it stops the watch.
pub struct FileWatcher {
    path: PathBuf,
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

impl FileWatcher {
    /// Send `event` on `tx` whenever `path` is created, modified or removed.
    pub fn start(
        path: &Path,
        debounce: Duration,
        event: WatchEvent,
        tx: mpsc::UnboundedSender<WatchEvent>,
    ) -> Result<Self> {
        let file_name = path
            .file_name()
            .with_context(|| format!("cannot watch '{}': no file name", path.display()))?
            .to_os_string();
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let touched = events.iter().any(|e| {
                        matches!(
                            e.kind,
                            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                        ) && e.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str()))
                    });
                    if touched {
                        debug!(event = ?event, "watched file changed");
                        let _ = tx.send(event.clone());
                    }
                },
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "file watcher error");
                    }
                },
            }
        })?;

        debouncer.watch(&dir, RecursiveMode::NonRecursive)?;
        info!(path = %path.display(), "watching file");

        Ok(Self {
            path: path.to_path_buf(),
            _debouncer: debouncer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
