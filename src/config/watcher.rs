//! Hot reload of the configuration file.
//!
//! The parent directory is watched rather than the file itself, since editors
//! commonly save by writing a temporary file and renaming it over the
//! original. Only validated configurations that differ from the last one
//! delivered are pushed to subscribers.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::{load_config, ConfigError};
use crate::config::schema::GatewayConfig;

/// Pushes re-validated configurations when the file changes on disk.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<GatewayConfig>,
    last: Arc<Mutex<Option<GatewayConfig>>>,
}

impl ConfigWatcher {
    /// Returns the watcher and the receiving end of the update channel.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<GatewayConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            update_tx,
            last: Arc::new(Mutex::new(load_config(path).ok())),
        };
        (watcher, update_rx)
    }

    /// Start watching. Events stop when the returned handle is dropped.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let watch_dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = self.path.file_name().map(|n| n.to_os_string());

        let path = self.path.clone();
        let tx = self.update_tx.clone();
        let last = self.last.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let relevant = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                        && event.paths.iter().any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if !relevant {
                        return;
                    }
                    match reload(&path, &last) {
                        Ok(Some(config)) => {
                            tracing::info!(path = ?path, "Configuration reloaded");
                            let _ = tx.send(config);
                        }
                        Ok(None) => tracing::debug!(path = ?path, "Configuration unchanged"),
                        Err(e) => {
                            tracing::error!(path = ?path, error = %e, "Reload rejected, keeping current configuration")
                        }
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

/// Load `path` and return it if it differs from `last`, remembering it.
fn reload(path: &Path, last: &Mutex<Option<GatewayConfig>>) -> Result<Option<GatewayConfig>, ConfigError> {
    let config = load_config(path)?;
    let mut last = last.lock().unwrap_or_else(|p| p.into_inner());
    if last.as_ref() == Some(&config) {
        return Ok(None);
    }
    *last = Some(config.clone());
    Ok(Some(config))
}
