//! Filesystem path policy: config locations and the safety predicate
//! applied to every user-supplied path before it reaches disk.

use crate::error::ConfigError;
use std::path::{Component, Path, PathBuf};

/// Directory prefixes no user config may point into.
const FORBIDDEN_ROOTS: &[&str] = &[
    "/etc", "/usr", "/bin", "/sbin", "/boot", "/proc", "/sys", "/var",
];

pub fn config_dir() -> Result<PathBuf, ConfigError> {
    let base = dirs::config_dir().ok_or_else(|| {
        ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no user config directory on this platform",
        ))
    })?;
    Ok(base.join("brain"))
}

pub fn config_file() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json"))
}

pub fn rollback_dir() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("rollback"))
}

/// Legacy config location handled by the one-shot migration.
pub fn legacy_config_file() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".basic-memory").join("brain-config.json"))
}

/// Expand a leading `~` against the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

/// Validate and normalize a user-supplied path. Rejects traversal
/// components, NUL bytes, relative paths, and system roots.
pub fn safe_path(raw: &str) -> Result<PathBuf, ConfigError> {
    if raw.is_empty() || raw.contains('\0') {
        return Err(ConfigError::PathRejected(raw.to_string()));
    }
    let expanded = expand_tilde(raw);

    let mut normalized = PathBuf::new();
    for component in expanded.components() {
        match component {
            Component::ParentDir => {
                return Err(ConfigError::PathRejected(raw.to_string()));
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    if !normalized.is_absolute() {
        return Err(ConfigError::PathRejected(raw.to_string()));
    }
    if is_forbidden(&normalized) {
        return Err(ConfigError::PathRejected(raw.to_string()));
    }
    Ok(normalized)
}

fn is_forbidden(path: &Path) -> bool {
    let lower = path.to_string_lossy().to_lowercase();
    if lower.starts_with("c:\\windows") || lower.starts_with("c:/windows") {
        return true;
    }
    FORBIDDEN_ROOTS
        .iter()
        .any(|root| path == Path::new(root) || path.starts_with(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_user_path_accepted() {
        let p = safe_path("/home/alice/memories").unwrap();
        assert_eq!(p, PathBuf::from("/home/alice/memories"));
    }

    #[test]
    fn traversal_rejected() {
        assert!(safe_path("/home/alice/../../etc/shadow").is_err());
        assert!(safe_path("..").is_err());
    }

    #[test]
    fn nul_and_empty_rejected() {
        assert!(safe_path("").is_err());
        assert!(safe_path("/tmp/a\0b").is_err());
    }

    #[test]
    fn system_roots_rejected() {
        assert!(safe_path("/etc/brain").is_err());
        assert!(safe_path("/usr/local/share").is_err());
        assert!(safe_path("/var/lib/brain").is_err());
    }

    #[test]
    fn relative_rejected() {
        assert!(safe_path("notes/memories").is_err());
    }

    #[test]
    fn curdir_components_dropped() {
        let p = safe_path("/home/alice/./notes").unwrap();
        assert_eq!(p, PathBuf::from("/home/alice/notes"));
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/notes"), home.join("notes"));
        }
    }
}
