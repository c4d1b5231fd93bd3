//! Brain configuration: the serde model, validation, atomic persistence,
//! and dotted-path access.
//!
//! The file lives at `~/.config/brain/config.json` (file 0600, dir 0700).
//! Saves are atomic: temp file in the same directory, fsync, rename.
//! Validation runs before the rename so a bad config never lands on disk.

use crate::error::ConfigError;
use crate::paths;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;

pub const CONFIG_VERSION: &str = "2.0.0";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum MemoriesMode {
    #[default]
    Default,
    Code,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    pub memories_location: String,
    #[serde(default)]
    pub memories_mode: MemoriesMode,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            memories_location: "~/memories".to_string(),
            memories_mode: MemoriesMode::Default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub code_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memories_path: Option<String>,
    #[serde(default)]
    pub memories_mode: MemoriesMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub enabled: bool,
    pub delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// A typo'd top-level key must fail the parse, not silently fall back to
// the default for the key the author meant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrainConfig {
    pub version: String,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectConfig>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            defaults: DefaultsConfig::default(),
            projects: BTreeMap::new(),
            sync: SyncConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl BrainConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version.is_empty() {
            return Err(ConfigError::Validation("version must be set".to_string()));
        }
        paths::safe_path(&self.defaults.memories_location)?;
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "unknown logging level '{}'",
                self.logging.level
            )));
        }
        for (name, project) in &self.projects {
            if name.is_empty() {
                return Err(ConfigError::Validation("empty project name".to_string()));
            }
            paths::safe_path(&project.code_path)?;
            match project.memories_mode {
                MemoriesMode::Custom => {
                    let path = project.memories_path.as_deref().ok_or_else(|| {
                        ConfigError::Validation(format!(
                            "project '{name}' uses CUSTOM mode without memories_path"
                        ))
                    })?;
                    paths::safe_path(path)?;
                }
                MemoriesMode::Default | MemoriesMode::Code => {
                    if let Some(path) = project.memories_path.as_deref() {
                        paths::safe_path(path)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve where a project's memories live on disk.
    pub fn resolved_memories_path(&self, name: &str) -> Result<PathBuf, ConfigError> {
        let project = self.projects.get(name).ok_or_else(|| {
            ConfigError::Validation(format!("unknown project '{name}'"))
        })?;
        let raw = match project.memories_mode {
            MemoriesMode::Default => {
                format!("{}/{name}", self.defaults.memories_location.trim_end_matches('/'))
            }
            MemoriesMode::Code => format!("{}/docs", project.code_path.trim_end_matches('/')),
            MemoriesMode::Custom => project
                .memories_path
                .clone()
                .ok_or_else(|| {
                    ConfigError::Validation(format!(
                        "project '{name}' uses CUSTOM mode without memories_path"
                    ))
                })?,
        };
        paths::safe_path(&raw)
    }
}

/// Loads, saves, and exposes dotted-path access to the config file.
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            path: paths::config_file()?,
        })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Read and validate the config; absent file yields defaults.
    pub fn load(&self) -> Result<BrainConfig, ConfigError> {
        if !self.path.exists() {
            return Ok(BrainConfig::default());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let config: BrainConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate, then write atomically: temp file, fsync, rename.
    pub fn save(&self, config: &BrainConfig) -> Result<(), ConfigError> {
        config.validate()?;

        let dir = self.path.parent().ok_or_else(|| {
            ConfigError::Validation("config path has no parent directory".to_string())
        })?;
        std::fs::create_dir_all(dir)?;
        set_mode(dir, 0o700)?;

        let tmp = self.path.with_extension(format!("json.tmp.{}", std::process::id()));
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(config)?.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        set_mode(&tmp, 0o600)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn get(&self, config: &BrainConfig, dotted: &str) -> Option<Value> {
        let mut cursor = serde_json::to_value(config).ok()?;
        for segment in dotted.split('.') {
            cursor = cursor.get(segment)?.clone();
        }
        Some(cursor)
    }

    /// Set a dotted path to a JSON value and return the updated,
    /// validated config. Does not persist; callers save explicitly so
    /// reconfiguration can run on the applied diff.
    pub fn set(
        &self,
        config: &BrainConfig,
        dotted: &str,
        value: Value,
    ) -> Result<BrainConfig, ConfigError> {
        let mut doc = serde_json::to_value(config)?;
        let mut cursor = &mut doc;
        let segments: Vec<&str> = dotted.split('.').collect();
        let (last, parents) = segments.split_last().ok_or_else(|| {
            ConfigError::Validation("empty config path".to_string())
        })?;
        for segment in parents {
            cursor = cursor
                .as_object_mut()
                .ok_or_else(|| {
                    ConfigError::Validation(format!("'{segment}' is not an object"))
                })?
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
        }
        cursor
            .as_object_mut()
            .ok_or_else(|| ConfigError::Validation(format!("'{dotted}' is not settable")))?
            .insert(last.to_string(), value);

        let updated: BrainConfig = serde_json::from_value(doc)?;
        updated.validate()?;
        Ok(updated)
    }

    /// Reset one dotted path (or everything, with `None`) to defaults.
    pub fn reset(
        &self,
        config: &BrainConfig,
        dotted: Option<&str>,
    ) -> Result<BrainConfig, ConfigError> {
        let Some(dotted) = dotted else {
            return Ok(BrainConfig::default());
        };
        let defaults = BrainConfig::default();
        let value = self.get(&defaults, dotted).ok_or_else(|| {
            ConfigError::Validation(format!("'{dotted}' has no default"))
        })?;
        self.set(config, dotted, value)
    }
}

#[cfg(unix)]
fn set_mode(path: &std::path::Path, mode: u32) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &std::path::Path, _mode: u32) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn manager() -> (TempDir, ConfigManager) {
        let tmp = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(tmp.path().join("config.json"));
        (tmp, manager)
    }

    fn sample() -> BrainConfig {
        let mut config = BrainConfig::default();
        config.defaults.memories_location = "/home/alice/memories".to_string();
        config.projects.insert(
            "brain".to_string(),
            ProjectConfig {
                code_path: "/home/alice/src/brain".to_string(),
                memories_path: None,
                memories_mode: MemoriesMode::Default,
            },
        );
        config
    }

    #[test]
    fn load_absent_returns_defaults() {
        let (_tmp, manager) = manager();
        let config = manager.load().unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert!(config.projects.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let (_tmp, manager) = manager();
        let config = sample();
        manager.save(&config).unwrap();
        assert_eq!(manager.load().unwrap(), config);
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_0600() {
        use std::os::unix::fs::PermissionsExt;
        let (_tmp, manager) = manager();
        manager.save(&sample()).unwrap();
        let mode = std::fs::metadata(manager.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn invalid_config_never_lands_on_disk() {
        let (_tmp, manager) = manager();
        manager.save(&sample()).unwrap();
        let mut bad = sample();
        bad.defaults.memories_location = "/etc/brain".to_string();
        assert!(manager.save(&bad).is_err());
        assert_eq!(manager.load().unwrap(), sample());
    }

    #[test]
    fn custom_mode_requires_memories_path() {
        let mut config = sample();
        config.projects.get_mut("brain").unwrap().memories_mode = MemoriesMode::Custom;
        assert!(config.validate().is_err());
        config.projects.get_mut("brain").unwrap().memories_path =
            Some("/home/alice/custom".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn resolved_memories_path_per_mode() {
        let mut config = sample();
        assert_eq!(
            config.resolved_memories_path("brain").unwrap(),
            PathBuf::from("/home/alice/memories/brain")
        );
        config.projects.get_mut("brain").unwrap().memories_mode = MemoriesMode::Code;
        assert_eq!(
            config.resolved_memories_path("brain").unwrap(),
            PathBuf::from("/home/alice/src/brain/docs")
        );
        let project = config.projects.get_mut("brain").unwrap();
        project.memories_mode = MemoriesMode::Custom;
        project.memories_path = Some("/home/alice/elsewhere".to_string());
        assert_eq!(
            config.resolved_memories_path("brain").unwrap(),
            PathBuf::from("/home/alice/elsewhere")
        );
    }

    #[test]
    fn dotted_get_set_reset() {
        let (_tmp, manager) = manager();
        let config = sample();
        assert_eq!(
            manager.get(&config, "sync.delay_ms"),
            Some(json!(1000))
        );
        let updated = manager.set(&config, "sync.delay_ms", json!(250)).unwrap();
        assert_eq!(updated.sync.delay_ms, 250);
        let reset = manager.reset(&updated, Some("sync.delay_ms")).unwrap();
        assert_eq!(reset.sync.delay_ms, 1000);
        let all = manager.reset(&updated, None).unwrap();
        assert_eq!(all, BrainConfig::default());
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let (_tmp, manager) = manager();
        std::fs::write(
            manager.path(),
            r#"{"version":"2.0.0","loging":{"level":"debug"}}"#,
        )
        .unwrap();
        assert!(manager.load().is_err());
    }

    #[test]
    fn set_rejects_schema_breaking_value() {
        let (_tmp, manager) = manager();
        let config = sample();
        assert!(manager
            .set(&config, "logging.level", json!("shout"))
            .is_err());
        assert!(manager.set(&config, "sync.enabled", json!("yes")).is_err());
    }
}
