//! Config rollback: a `lastKnownGood` baseline captured at startup plus
//! a bounded FIFO of prior configs. Restoring goes through the normal
//! save path so translation and downstream reconfiguration run exactly
//! as they would for a user edit.

use crate::config::{BrainConfig, ConfigManager};
use crate::error::ConfigError;
use crate::translate;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const MAX_SNAPSHOTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackTarget {
    LastKnownGood,
    Previous,
}

impl RollbackTarget {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "last-known-good" | "lastKnownGood" => Some(Self::LastKnownGood),
            "previous" => Some(Self::Previous),
            _ => None,
        }
    }
}

pub struct RollbackManager {
    manager: Arc<ConfigManager>,
    upstream_path: Option<std::path::PathBuf>,
    last_known_good: Mutex<BrainConfig>,
    snapshots: Mutex<VecDeque<BrainConfig>>,
}

impl RollbackManager {
    /// Baseline is whatever validates on disk right now.
    pub fn new(manager: Arc<ConfigManager>) -> Result<Self, ConfigError> {
        let baseline = manager.load()?;
        Ok(Self {
            manager,
            upstream_path: None,
            last_known_good: Mutex::new(baseline),
            snapshots: Mutex::new(VecDeque::new()),
        })
    }

    /// Override the upstream config location (the conventional path
    /// otherwise).
    pub fn with_upstream_path(mut self, path: std::path::PathBuf) -> Self {
        self.upstream_path = Some(path);
        self
    }

    /// Record the config being replaced. Oldest snapshot falls off once
    /// the ring is full.
    pub fn record(&self, config: &BrainConfig) {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        snapshots.push_back(config.clone());
        while snapshots.len() > MAX_SNAPSHOTS {
            snapshots.pop_front();
        }
    }

    /// Promote a successfully applied config to the baseline.
    pub fn promote(&self, config: &BrainConfig) {
        *self.last_known_good.lock().unwrap_or_else(|e| e.into_inner()) = config.clone();
    }

    pub fn last_known_good(&self) -> BrainConfig {
        self.last_known_good
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Restore a snapshot via `save()`, then re-sync upstream.
    pub fn rollback(&self, target: RollbackTarget) -> Result<BrainConfig, ConfigError> {
        let config = match target {
            RollbackTarget::LastKnownGood => self.last_known_good(),
            RollbackTarget::Previous => {
                let mut snapshots =
                    self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
                snapshots.pop_back().ok_or_else(|| {
                    ConfigError::Validation("no previous snapshot to roll back to".to_string())
                })?
            }
        };
        self.manager.save(&config)?;
        translate::sync_upstream(&config, self.upstream_path.clone());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<ConfigManager>, RollbackManager) {
        let tmp = TempDir::new().unwrap();
        let manager = Arc::new(ConfigManager::with_path(tmp.path().join("config.json")));
        let rollback = RollbackManager::new(Arc::clone(&manager))
            .unwrap()
            .with_upstream_path(tmp.path().join("upstream.json"));
        (tmp, manager, rollback)
    }

    fn config_with_delay(delay_ms: u64) -> BrainConfig {
        let mut config = BrainConfig::default();
        config.defaults.memories_location = "/home/alice/memories".to_string();
        config.sync.delay_ms = delay_ms;
        config
    }

    #[test]
    fn ring_keeps_at_most_ten() {
        let (_tmp, _manager, rollback) = setup();
        for i in 0..15 {
            rollback.record(&config_with_delay(i));
        }
        assert_eq!(rollback.snapshot_count(), 10);
    }

    #[test]
    fn previous_restores_most_recent_snapshot() {
        let (_tmp, manager, rollback) = setup();
        rollback.record(&config_with_delay(100));
        rollback.record(&config_with_delay(200));
        let restored = rollback.rollback(RollbackTarget::Previous).unwrap();
        assert_eq!(restored.sync.delay_ms, 200);
        assert_eq!(manager.load().unwrap().sync.delay_ms, 200);
        assert_eq!(rollback.snapshot_count(), 1);
    }

    #[test]
    fn last_known_good_is_startup_baseline() {
        let tmp = TempDir::new().unwrap();
        let manager = Arc::new(ConfigManager::with_path(tmp.path().join("config.json")));
        manager.save(&config_with_delay(42)).unwrap();

        let rollback = RollbackManager::new(Arc::clone(&manager))
            .unwrap()
            .with_upstream_path(tmp.path().join("upstream.json"));
        manager.save(&config_with_delay(999)).unwrap();

        let restored = rollback.rollback(RollbackTarget::LastKnownGood).unwrap();
        assert_eq!(restored.sync.delay_ms, 42);
        assert_eq!(manager.load().unwrap().sync.delay_ms, 42);
    }

    #[test]
    fn previous_without_snapshots_errors() {
        let (_tmp, _manager, rollback) = setup();
        assert!(rollback.rollback(RollbackTarget::Previous).is_err());
    }
}
