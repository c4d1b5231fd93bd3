//! Config file watcher.
//!
//! Watches the config directory, debounces editor write bursts (2 s),
//! probes for in-flight partial writes (checksum at T0 and T0+500 ms),
//! and hands stable, schema-valid edits to the reconfigurator. Invalid
//! edits are rejected; the last known good config stays authoritative.
//! Edits arriving while a migration holds the locks simply wait their
//! turn behind them.

use crate::config::ConfigManager;
use crate::error::ConfigError;
use crate::manifest::file_checksum;
use crate::reconfigure::Reconfigurator;
use crate::rollback::{RollbackManager, RollbackTarget};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const DEBOUNCE: Duration = Duration::from_secs(2);
const PARTIAL_WRITE_PROBE: Duration = Duration::from_millis(500);

pub struct WatcherHandle {
    // Dropping the watcher unsubscribes from filesystem events.
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl WatcherHandle {
    pub fn abort(self) {
        self.task.abort();
    }
}

/// Returns true once two checksums taken `probe` apart agree, meaning
/// the writer has finished. Gives up after a few rounds.
pub async fn file_quiesced(path: &Path, probe: Duration) -> bool {
    for _ in 0..5 {
        let before = file_checksum(path).ok();
        tokio::time::sleep(probe).await;
        let after = file_checksum(path).ok();
        if before.is_some() && before == after {
            return true;
        }
    }
    false
}

pub struct ConfigWatcher {
    manager: Arc<ConfigManager>,
    reconfigurator: Arc<Reconfigurator>,
    rollback: Arc<RollbackManager>,
}

impl ConfigWatcher {
    pub fn new(
        manager: Arc<ConfigManager>,
        reconfigurator: Arc<Reconfigurator>,
        rollback: Arc<RollbackManager>,
    ) -> Self {
        Self {
            manager,
            reconfigurator,
            rollback,
        }
    }

    /// Start watching the config file's directory. Returns a handle that
    /// keeps the subscription alive.
    pub fn spawn(self) -> Result<WatcherHandle, ConfigError> {
        let config_path = self.manager.path().clone();
        let dir = config_path
            .parent()
            .ok_or_else(|| {
                ConfigError::Validation("config path has no parent directory".to_string())
            })?
            .to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let watched = config_path.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            let Ok(event) = result else { return };
            // Only the config file itself; manifests and temp files share
            // the directory.
            if event.paths.iter().any(|p| p == &watched) {
                let _ = tx.send(());
            }
        })
        .map_err(|e| ConfigError::Validation(format!("watcher init failed: {e}")))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Validation(format!("watch failed: {e}")))?;

        let task = tokio::spawn(self.run(rx, config_path));
        Ok(WatcherHandle {
            _watcher: watcher,
            task,
        })
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<()>, config_path: std::path::PathBuf) {
        while rx.recv().await.is_some() {
            // Debounce: absorb the burst until the file has been quiet
            // for the full window.
            loop {
                match tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }
            self.handle_change(&config_path).await;
        }
    }

    async fn handle_change(&self, config_path: &Path) {
        if !config_path.exists() {
            tracing::warn!("config file removed; keeping last known good");
            return;
        }
        if !file_quiesced(config_path, PARTIAL_WRITE_PROBE).await {
            tracing::debug!("config still being written; deferring");
            return;
        }

        let new_config = match self.manager.load() {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(error = %err, "invalid config edit rejected; last known good preserved");
                return;
            }
        };

        match self.reconfigurator.apply(new_config).await {
            Ok(diff) if diff.is_empty() => {
                tracing::debug!("config change carried no effective diff");
            }
            Ok(diff) => {
                tracing::info!(?diff, "config change applied from watcher");
            }
            Err(err) => {
                tracing::error!(error = %err, "reconfiguration failed; rolling back");
                if let Err(rb) = self.rollback.rollback(RollbackTarget::LastKnownGood) {
                    tracing::error!(error = %rb, "rollback to last known good failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn quiesced_detects_stable_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, b"{}").unwrap();
        assert!(file_quiesced(&path, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn quiesced_waits_out_an_active_writer() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, b"v0").unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            for i in 1..3u8 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                std::fs::write(&writer_path, format!("v{i}")).unwrap();
            }
        });
        assert!(file_quiesced(&path, Duration::from_millis(20)).await);
        writer.await.unwrap();
    }
}
