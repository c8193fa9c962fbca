//! Reload the configuration when its file changes on disk.
//!
//! The parent directory is watched rather than the file itself so editors
//! that save by rename keep triggering reloads. Bursts of events are
//! collapsed into one reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::EngineConfig;

/// Quiet period after the last event before the file is read.
const SETTLE: Duration = Duration::from_millis(250);

/// Watches one configuration file. Successfully loaded configurations
/// arrive on the receiver returned by [`ConfigWatcher::new`]; a file that
/// fails to load or validate is logged and skipped.
pub struct ConfigWatcher {
    path: PathBuf,
    updates: mpsc::UnboundedSender<EngineConfig>,
}

impl ConfigWatcher {
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<EngineConfig>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            updates,
        };
        (watcher, rx)
    }

    /// Start watching. Must be called inside a tokio runtime; dropping the
    /// returned handle stops the watch.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self { path, updates } = self;
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path.file_name().map(|name| name.to_os_string());

        let (touched_tx, touched_rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let relevant = (event.kind.is_modify() || event.kind.is_create())
                        && event
                            .paths
                            .iter()
                            .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if relevant {
                        let _ = touched_tx.send(());
                    }
                }
                Err(e) => tracing::warn!(error = %e, "config watch error"),
            },
            Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        tokio::spawn(reload_on_change(path.clone(), touched_rx, updates));
        tracing::info!(path = %path.display(), "watching configuration file");
        Ok(watcher)
    }
}

async fn reload_on_change(
    path: PathBuf,
    mut touched: mpsc::UnboundedReceiver<()>,
    updates: mpsc::UnboundedSender<EngineConfig>,
) {
    while touched.recv().await.is_some() {
        // Wait until the writer is done.
        loop {
            match tokio::time::timeout(SETTLE, touched.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        match load_config(&path) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "configuration file changed");
                if updates.send(config).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "ignoring changed configuration file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_of_changes_reloads_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[workers]\nconcurrency = 2\n").unwrap();

        let (touched_tx, touched_rx) = mpsc::unbounded_channel();
        let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(reload_on_change(path.clone(), touched_rx, updates_tx));

        std::fs::write(&path, "[workers]\nconcurrency = 3\n").unwrap();
        for _ in 0..5 {
            touched_tx.send(()).unwrap();
        }
        let config = updates_rx.recv().await.unwrap();
        assert_eq!(config.workers.concurrency, 3);

        drop(touched_tx);
        task.await.unwrap();
        assert!(updates_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[workers]\nconcurrency = 0\n").unwrap();

        let (touched_tx, touched_rx) = mpsc::unbounded_channel();
        let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(reload_on_change(path, touched_rx, updates_tx));

        touched_tx.send(()).unwrap();
        tokio::time::sleep(SETTLE * 2).await;
        drop(touched_tx);
        task.await.unwrap();
        assert!(updates_rx.recv().await.is_none());
    }
}
