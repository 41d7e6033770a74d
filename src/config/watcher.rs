//! Hot reload of the config file.
//!
//! Watches the config file's directory (editors often replace the file
//! rather than write it in place) and reloads the runtime snapshots after
//! changes settle.

use super::RuntimeConfig;

use anyhow::Context as _;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::{mpsc, watch};

use std::sync::Arc;
use std::time::Duration;

/// Quiet period before a burst of file events triggers one reload.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Keeps the underlying OS watcher alive. Dropping it stops reloads.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    handle: tokio::task::JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching the file `runtime` was loaded from.
    pub fn spawn(
        runtime: Arc<RuntimeConfig>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let path = runtime
            .path()
            .context("runtime config has no file to watch")?
            .to_path_buf();
        let file_name = path
            .file_name()
            .context("config path has no file name")?
            .to_os_string();
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) && event
                        .paths
                        .iter()
                        .any(|changed| changed.file_name() == Some(file_name.as_os_str()));
                    if relevant {
                        let _ = tx.send(());
                    }
                }
                Err(error) => tracing::warn!(%error, "config watcher error"),
            }
        })
        .context("failed to create config watcher")?;

        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", directory.display()))?;
        tracing::info!(path = %path.display(), "watching config for changes");

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = rx.recv() => {
                        if changed.is_none() {
                            break;
                        }
                        // Let the burst settle.
                        loop {
                            match tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                                Ok(Some(())) => continue,
                                Ok(None) | Err(_) => break,
                            }
                        }
                        if let Err(error) = runtime.reload() {
                            tracing::warn!(%error, "config reload failed, keeping previous settings");
                        }
                    }
                    _ = async { shutdown_rx.wait_for(|shutdown| *shutdown).await.map(|_| ()) } => break,
                }
            }
            tracing::debug!("config watcher stopped");
        });

        Ok(Self {
            _watcher: watcher,
            handle,
        })
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
