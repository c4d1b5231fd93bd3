//! Copy manifests: the durable record of an in-flight memories-root
//! migration.
//!
//! A manifest is persisted before the first byte is copied, updated
//! after every entry transition, and deleted only once every entry is
//! verified. Anything found in a non-terminal state at startup is rolled
//! back. Rollback removes only files this manifest put there.

use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write as _};
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Copied,
    Verified,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestState {
    InProgress,
    Completed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    pub source_checksum: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_checksum: Option<String>,
    pub status: EntryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copied_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyManifest {
    pub id: String,
    pub project: String,
    pub created_at: DateTime<Utc>,
    pub state: ManifestState,
    pub entries: Vec<ManifestEntry>,
}

/// Streaming SHA-256 of a file, hex encoded.
pub fn file_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

impl CopyManifest {
    /// Enumerate every file under `source_root` and checksum it. The
    /// manifest starts fully pending; nothing is copied yet.
    pub fn plan(
        project: &str,
        source_root: &Path,
        target_root: &Path,
    ) -> Result<Self, ConfigError> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(source_root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                ConfigError::Io(e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::other("walk failed on a non-io error")
                }))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let source_path = entry.path().to_path_buf();
            let relative = source_path
                .strip_prefix(source_root)
                .map_err(|_| ConfigError::PathRejected(source_path.display().to_string()))?;
            entries.push(ManifestEntry {
                target_path: target_root.join(relative),
                source_checksum: file_checksum(&source_path)?,
                source_path,
                target_checksum: None,
                status: EntryStatus::Pending,
                copied_at: None,
                error: None,
            });
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            project: project.to_string(),
            created_at: Utc::now(),
            state: ManifestState::InProgress,
            entries,
        })
    }

    pub fn manifest_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("manifest-{}.json", self.id))
    }

    /// Persist atomically under `dir`.
    pub fn persist(&self, dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(dir)?;
        let path = self.manifest_path(dir);
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Copy and verify every entry, persisting after each transition.
    /// The first failure marks the entry, persists, and returns; the
    /// caller decides whether to roll back.
    pub fn execute(&mut self, dir: &Path) -> Result<(), ConfigError> {
        self.persist(dir)?;
        for ix in 0..self.entries.len() {
            if let Err(message) = self.copy_and_verify(ix) {
                let failed = self.entries[ix].source_path.clone();
                self.entries[ix].status = EntryStatus::Failed;
                self.entries[ix].error = Some(message.clone());
                self.persist(dir)?;
                return Err(ConfigError::Reconfiguration {
                    message,
                    failed_entry: Some(failed),
                });
            }
            self.persist(dir)?;
        }
        self.state = ManifestState::Completed;
        // All entries verified: the manifest has nothing left to protect.
        std::fs::remove_file(self.manifest_path(dir))?;
        Ok(())
    }

    fn copy_and_verify(&mut self, ix: usize) -> Result<(), String> {
        let (source, target) = {
            let entry = &self.entries[ix];
            (entry.source_path.clone(), entry.target_path.clone())
        };
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::copy(&source, &target).map_err(|e| e.to_string())?;
        self.entries[ix].status = EntryStatus::Copied;
        self.entries[ix].copied_at = Some(Utc::now());

        let checksum = file_checksum(&target).map_err(|e| e.to_string())?;
        if checksum != self.entries[ix].source_checksum {
            return Err(format!(
                "checksum mismatch after copy: {}",
                target.display()
            ));
        }
        self.entries[ix].target_checksum = Some(checksum);
        self.entries[ix].status = EntryStatus::Verified;
        Ok(())
    }

    /// Remove every file this manifest copied. Pending and failed
    /// entries never reached the target and are left alone.
    pub fn rollback(&mut self, dir: &Path) -> Result<(), ConfigError> {
        for entry in &mut self.entries {
            if matches!(entry.status, EntryStatus::Copied | EntryStatus::Verified) {
                match std::fs::remove_file(&entry.target_path) {
                    Ok(()) => entry.status = EntryStatus::Pending,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        entry.status = EntryStatus::Pending;
                    }
                    Err(e) => return Err(ConfigError::Io(e)),
                }
            }
        }
        self.state = ManifestState::RolledBack;
        let path = self.manifest_path(dir);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.state, ManifestState::InProgress)
    }
}

/// Load every persisted manifest under `dir`.
pub fn load_all(dir: &Path) -> Result<Vec<CopyManifest>, ConfigError> {
    let mut manifests = Vec::new();
    if !dir.is_dir() {
        return Ok(manifests);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path.file_name().map(|n| n.to_string_lossy().to_string());
        let is_manifest = name
            .as_deref()
            .map(|n| n.starts_with("manifest-") && n.ends_with(".json"))
            .unwrap_or(false);
        if !is_manifest {
            continue;
        }
        let raw = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&raw) {
            Ok(manifest) => manifests.push(manifest),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "unreadable copy manifest"),
        }
    }
    Ok(manifests)
}

/// Startup crash recovery: roll back any manifest left non-terminal.
pub fn recover(dir: &Path) -> Result<usize, ConfigError> {
    let mut rolled_back = 0;
    for mut manifest in load_all(dir)? {
        if manifest.is_terminal() {
            continue;
        }
        tracing::warn!(manifest = %manifest.id, project = %manifest.project, "rolling back interrupted migration");
        manifest.rollback(dir)?;
        rolled_back += 1;
    }
    Ok(rolled_back)
}
