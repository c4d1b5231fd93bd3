//! Reconfiguration: diffing configs, the lock hierarchy, and the
//! apply/migrate/rollback protocol.
//!
//! A diff touching global fields (or more than one project) takes the
//! exclusive global lock; a single-project diff takes the shared global
//! lock plus that project's mutex, so unrelated projects reconfigure in
//! parallel. Acquisition times out at 30 s.

use crate::config::{BrainConfig, ConfigManager};
use crate::error::ConfigError;
use crate::manifest::CopyManifest;
use crate::pipeline::EmbeddingPipeline;
use crate::rollback::RollbackManager;
use crate::translate;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

const LOCK_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDiff {
    pub projects_added: Vec<String>,
    pub projects_removed: Vec<String>,
    pub projects_modified: Vec<String>,
    pub global_fields_changed: Vec<String>,
}

impl ConfigDiff {
    pub fn compute(old: &BrainConfig, new: &BrainConfig) -> Self {
        let mut diff = Self::default();

        for (name, project) in &new.projects {
            match old.projects.get(name) {
                None => diff.projects_added.push(name.clone()),
                Some(prior) if prior != project => diff.projects_modified.push(name.clone()),
                Some(_) => {}
            }
        }
        for name in old.projects.keys() {
            if !new.projects.contains_key(name) {
                diff.projects_removed.push(name.clone());
            }
        }

        if old.version != new.version {
            diff.global_fields_changed.push("version".to_string());
        }
        if old.defaults != new.defaults {
            diff.global_fields_changed.push("defaults".to_string());
        }
        if old.sync != new.sync {
            diff.global_fields_changed.push("sync".to_string());
        }
        if old.logging != new.logging {
            diff.global_fields_changed.push("logging".to_string());
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.projects_added.is_empty()
            && self.projects_removed.is_empty()
            && self.projects_modified.is_empty()
            && self.global_fields_changed.is_empty()
    }

    /// Projects whose note roots may need attention.
    pub fn affected_projects(&self) -> Vec<String> {
        let mut projects: Vec<String> = self
            .projects_added
            .iter()
            .chain(&self.projects_modified)
            .cloned()
            .collect();
        projects.sort();
        projects.dedup();
        projects
    }

    fn needs_global_lock(&self) -> bool {
        !self.global_fields_changed.is_empty()
            || !self.projects_removed.is_empty()
            || self.affected_projects().len() > 1
    }
}

/// Hierarchical lock set: global exclusive blocks everything; project
/// locks share the global lock and exclude only their own project.
pub struct LockManager {
    global: Arc<RwLock<()>>,
    projects: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

pub enum ReconfigureGuard {
    Global(OwnedRwLockWriteGuard<()>),
    Projects {
        _shared: OwnedRwLockReadGuard<()>,
        _projects: Vec<OwnedMutexGuard<()>>,
    },
}

impl Default for LockManager {
    fn default() -> Self {
        Self {
            global: Arc::new(RwLock::new(())),
            projects: Mutex::new(HashMap::new()),
        }
    }
}

impl LockManager {
    pub async fn acquire_global(&self) -> Result<ReconfigureGuard, ConfigError> {
        let guard = tokio::time::timeout(
            Duration::from_secs(LOCK_TIMEOUT_SECS),
            Arc::clone(&self.global).write_owned(),
        )
        .await
        .map_err(|_| ConfigError::LockTimeout {
            scope: "global".to_string(),
            seconds: LOCK_TIMEOUT_SECS,
        })?;
        Ok(ReconfigureGuard::Global(guard))
    }

    /// Lock a set of projects. Names are sorted so concurrent callers
    /// acquire in the same order.
    pub async fn acquire_projects(
        &self,
        names: &[String],
    ) -> Result<ReconfigureGuard, ConfigError> {
        let shared = tokio::time::timeout(
            Duration::from_secs(LOCK_TIMEOUT_SECS),
            Arc::clone(&self.global).read_owned(),
        )
        .await
        .map_err(|_| ConfigError::LockTimeout {
            scope: "global".to_string(),
            seconds: LOCK_TIMEOUT_SECS,
        })?;

        let mut sorted: Vec<String> = names.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for name in sorted {
            let lock = {
                let mut projects = self.projects.lock().await;
                // Entries held only by the map belong to finished
                // reconfigurations; evict them before adding ours.
                projects.retain(|_, lock| Arc::strong_count(lock) > 1);
                projects
                    .entry(name.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone()
            };
            let guard = tokio::time::timeout(
                Duration::from_secs(LOCK_TIMEOUT_SECS),
                lock.lock_owned(),
            )
            .await
            .map_err(|_| ConfigError::LockTimeout {
                scope: format!("project:{name}"),
                seconds: LOCK_TIMEOUT_SECS,
            })?;
            guards.push(guard);
        }
        Ok(ReconfigureGuard::Projects {
            _shared: shared,
            _projects: guards,
        })
    }
}

pub struct Reconfigurator {
    manager: Arc<ConfigManager>,
    rollback: Arc<RollbackManager>,
    locks: Arc<LockManager>,
    rollback_dir: PathBuf,
    upstream_path: Option<PathBuf>,
    pipeline: Option<Arc<EmbeddingPipeline>>,
}

impl Reconfigurator {
    pub fn new(
        manager: Arc<ConfigManager>,
        rollback: Arc<RollbackManager>,
        locks: Arc<LockManager>,
        rollback_dir: PathBuf,
    ) -> Self {
        Self {
            manager,
            rollback,
            locks,
            rollback_dir,
            upstream_path: None,
            pipeline: None,
        }
    }

    pub fn with_upstream_path(mut self, path: PathBuf) -> Self {
        self.upstream_path = Some(path);
        self
    }

    /// Wire in the pipeline so applied diffs trigger embedding catch-up.
    pub fn with_pipeline(mut self, pipeline: Arc<EmbeddingPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Apply a new config: lock, snapshot, save, migrate note roots,
    /// sync upstream, promote. Any migration failure restores the prior
    /// config on disk and upstream before surfacing.
    pub async fn apply(&self, new_config: BrainConfig) -> Result<ConfigDiff, ConfigError> {
        new_config.validate()?;
        let old = self.manager.load()?;
        let diff = ConfigDiff::compute(&old, &new_config);
        if diff.is_empty() {
            return Ok(diff);
        }

        let _guard = if diff.needs_global_lock() {
            self.locks.acquire_global().await?
        } else {
            self.locks.acquire_projects(&diff.affected_projects()).await?
        };

        self.rollback.record(&old);
        self.manager.save(&new_config)?;

        if let Err(err) = self.migrate_roots(&old, &new_config, &diff) {
            self.manager.save(&old)?;
            translate::sync_upstream(&old, self.upstream_path.clone());
            return Err(err);
        }

        translate::sync_upstream(&new_config, self.upstream_path.clone());
        self.rollback.promote(&new_config);
        self.trigger_catch_up(&diff);

        tracing::info!(
            added = diff.projects_added.len(),
            removed = diff.projects_removed.len(),
            modified = diff.projects_modified.len(),
            global = ?diff.global_fields_changed,
            "configuration applied"
        );
        Ok(diff)
    }

    /// Copy note roots for projects whose resolved memories path moved.
    /// A failed copy is rolled back file-by-file before returning.
    fn migrate_roots(
        &self,
        old: &BrainConfig,
        new: &BrainConfig,
        diff: &ConfigDiff,
    ) -> Result<(), ConfigError> {
        for name in diff.affected_projects() {
            let new_path = new.resolved_memories_path(&name)?;
            let old_path = match old.resolved_memories_path(&name) {
                Ok(path) => path,
                // Newly added project: nothing to move.
                Err(_) => continue,
            };
            if old_path == new_path || !old_path.is_dir() {
                continue;
            }

            let mut manifest = CopyManifest::plan(&name, &old_path, &new_path)?;
            tracing::info!(
                project = %name,
                from = %old_path.display(),
                to = %new_path.display(),
                files = manifest.entries.len(),
                "migrating note root"
            );
            if let Err(err) = manifest.execute(&self.rollback_dir) {
                if let Err(rb) = manifest.rollback(&self.rollback_dir) {
                    tracing::error!(project = %name, error = %rb, "manifest rollback failed");
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn trigger_catch_up(&self, diff: &ConfigDiff) {
        let Some(pipeline) = &self.pipeline else {
            return;
        };
        for project in diff.affected_projects() {
            let pipeline = Arc::clone(pipeline);
            tokio::spawn(async move {
                let report = pipeline.catch_up_project(&project).await;
                tracing::info!(
                    project = %project,
                    embedded = report.embedded,
                    "post-reconfigure catch-up complete"
                );
            });
        }
    }
}

/// One-shot migration from the legacy config location. No-op when the
/// current config already exists or no legacy file is found. The legacy
/// file is left in place.
pub fn migrate_legacy(
    manager: &ConfigManager,
    legacy_path: Option<PathBuf>,
) -> Result<Option<BrainConfig>, ConfigError> {
    if manager.path().exists() {
        return Ok(None);
    }
    let Some(legacy_path) = legacy_path.or_else(crate::paths::legacy_config_file) else {
        return Ok(None);
    };
    if !legacy_path.is_file() {
        return Ok(None);
    }

    let raw = std::fs::read_to_string(&legacy_path)?;
    let legacy: serde_json::Value = serde_json::from_str(&raw)?;

    let mut config = BrainConfig::default();
    if let Some(location) = legacy
        .get("memories_location")
        .or_else(|| legacy.pointer("/defaults/memories_location"))
        .and_then(|v| v.as_str())
    {
        config.defaults.memories_location = location.to_string();
    }
    if let Some(projects) = legacy.get("projects").and_then(|v| v.as_object()) {
        for (name, value) in projects {
            let project = match value {
                serde_json::Value::String(code_path) => crate::config::ProjectConfig {
                    code_path: code_path.clone(),
                    memories_path: None,
                    memories_mode: Default::default(),
                },
                other => serde_json::from_value(other.clone())?,
            };
            config.projects.insert(name.clone(), project);
        }
    }
    if let Some(enabled) = legacy
        .get("sync_changes")
        .or_else(|| legacy.pointer("/sync/enabled"))
        .and_then(|v| v.as_bool())
    {
        config.sync.enabled = enabled;
    }
    if let Some(delay) = legacy
        .get("sync_delay")
        .or_else(|| legacy.pointer("/sync/delay_ms"))
        .and_then(|v| v.as_u64())
    {
        config.sync.delay_ms = delay;
    }
    if let Some(level) = legacy
        .get("log_level")
        .or_else(|| legacy.pointer("/logging/level"))
        .and_then(|v| v.as_str())
    {
        config.logging.level = level.to_string();
    }

    manager.save(&config)?;
    tracing::info!(from = %legacy_path.display(), to = %manager.path().display(), "legacy config migrated");
    Ok(Some(config))
}
