//! One-way translation of the Brain config into the upstream note
//! store's config file. Runs after every save; a failed upstream write
//! is logged and never undoes the Brain-side save.

use crate::config::BrainConfig;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Project name to resolved memories path.
    pub projects: BTreeMap<String, String>,
    pub sync_changes: bool,
    pub sync_delay: u64,
    pub log_level: String,
}

pub fn upstream_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".basic-memory").join("config.json"))
}

/// Deterministic mapping; resolution failures skip the project rather
/// than failing the translation.
pub fn translate(config: &BrainConfig) -> UpstreamConfig {
    let mut projects = BTreeMap::new();
    for name in config.projects.keys() {
        match config.resolved_memories_path(name) {
            Ok(path) => {
                projects.insert(name.clone(), path.to_string_lossy().to_string());
            }
            Err(err) => {
                tracing::warn!(project = %name, error = %err, "project skipped in upstream translation");
            }
        }
    }
    UpstreamConfig {
        projects,
        sync_changes: config.sync.enabled,
        sync_delay: config.sync.delay_ms,
        log_level: config.logging.level.clone(),
    }
}

/// Write the translated config atomically at `path` (0600).
pub fn write_upstream(upstream: &UpstreamConfig, path: &PathBuf) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension(format!("json.tmp.{}", std::process::id()));
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(serde_json::to_string_pretty(upstream)?.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Translate and sync to the upstream location. Failure is logged, not
/// returned; the Brain config is already saved and stays authoritative.
pub fn sync_upstream(config: &BrainConfig, path: Option<PathBuf>) {
    let Some(path) = path.or_else(upstream_config_path) else {
        tracing::warn!("no home directory; upstream config not written");
        return;
    };
    let upstream = translate(config);
    if let Err(err) = write_upstream(&upstream, &path) {
        tracing::warn!(path = %path.display(), error = %err, "upstream config write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoriesMode, ProjectConfig};
    use tempfile::TempDir;

    fn config() -> BrainConfig {
        let mut config = BrainConfig::default();
        config.defaults.memories_location = "/home/alice/memories".to_string();
        config.sync.enabled = false;
        config.sync.delay_ms = 750;
        config.logging.level = "debug".to_string();
        config.projects.insert(
            "alpha".to_string(),
            ProjectConfig {
                code_path: "/home/alice/src/alpha".to_string(),
                memories_path: None,
                memories_mode: MemoriesMode::Default,
            },
        );
        config.projects.insert(
            "beta".to_string(),
            ProjectConfig {
                code_path: "/home/alice/src/beta".to_string(),
                memories_path: None,
                memories_mode: MemoriesMode::Code,
            },
        );
        config
    }

    #[test]
    fn maps_fields_and_resolves_paths() {
        let upstream = translate(&config());
        assert_eq!(
            upstream.projects.get("alpha").map(String::as_str),
            Some("/home/alice/memories/alpha")
        );
        assert_eq!(
            upstream.projects.get("beta").map(String::as_str),
            Some("/home/alice/src/beta/docs")
        );
        assert!(!upstream.sync_changes);
        assert_eq!(upstream.sync_delay, 750);
        assert_eq!(upstream.log_level, "debug");
    }

    #[test]
    fn write_is_atomic_and_parseable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("upstream").join("config.json");
        let upstream = translate(&config());
        write_upstream(&upstream, &path).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: UpstreamConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, upstream);
    }

    #[test]
    fn translation_is_deterministic() {
        let a = translate(&config());
        let b = translate(&config());
        assert_eq!(a, b);
    }
}
