//! Typed error kinds for every public subsystem boundary.
//!
//! Errors cross component boundaries as values; retry and escalation
//! policy lives in the caller. `anyhow` is used only at the binary and
//! server edges.

use std::path::PathBuf;

/// Errors from the embedding model HTTP client.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// 5xx, connection reset, or EOF; the caller may retry.
    #[error("retryable model error{}: {message}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Retryable {
        status: Option<u16>,
        message: String,
    },

    /// 4xx or malformed response; do not retry.
    #[error("model request failed (status {status}): {message}")]
    Fatal { status: u16, message: String },

    /// The server returned a different number of vectors than texts sent.
    #[error("embedding count mismatch: sent {sent} texts, received {received} vectors")]
    IndexMismatch { sent: usize, received: usize },

    /// The retry budget is spent; the last retryable failure, now
    /// terminal. Callers must not retry again.
    #[error("embedding failed after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    /// The 60 s request budget was exceeded.
    #[error("embedding request deadline exceeded")]
    Timeout,
}

impl ModelError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModelError::Retryable { .. })
    }
}

/// Errors from the on-disk vector index.
#[derive(Debug, thiserror::Error)]
pub enum VectorIndexError {
    #[error("vector index corrupt: {0}")]
    Corrupt(String),

    #[error("vector index I/O error: {0}")]
    Io(#[from] sqlx::Error),

    /// Stored vectors have a different dimension than the active model.
    /// Fatal for the whole batch; a full re-embed is required.
    #[error("embedding dimension mismatch: index has {stored}, model produces {model}")]
    DimensionMismatch { stored: usize, model: usize },
}

/// Errors from the session-state store.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("version conflict on session {session_id} after {attempts} attempts")]
    VersionConflict { session_id: String, attempts: u32 },

    #[error("signature verification failed for session {session_id}")]
    Signature { session_id: String },

    #[error("BRAIN_SESSION_SECRET is not set")]
    MissingSecret,

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("note store error: {0}")]
    Upstream(String),

    #[error("session serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors from the search service.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("upstream note store unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("query rejected by input guard: {0}")]
    GuardRejected(String),

    #[error(transparent)]
    Index(#[from] VectorIndexError),
}

/// Errors from configuration management and reconfiguration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("path rejected: {0}")]
    PathRejected(String),

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("timed out acquiring {scope} lock after {seconds}s")]
    LockTimeout { scope: String, seconds: u64 },

    /// A migration step failed. The copy manifest and prior config have
    /// been rolled back; `failed_entry` names the file that broke.
    #[error("reconfiguration failed: {message}")]
    Reconfiguration {
        message: String,
        failed_entry: Option<PathBuf>,
    },

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors from the workflow coordinator.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow step '{step}' timed out after {seconds}s")]
    StepTimeout { step: String, seconds: u64 },

    #[error("session protocol validation failed: {}", failed.join("; "))]
    ProtocolValidation { failed: Vec<String> },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("workflow error: {0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let e = ModelError::Retryable {
            status: Some(503),
            message: "busy".into(),
        };
        assert!(e.is_retryable());
        let e = ModelError::Fatal {
            status: 400,
            message: "bad input".into(),
        };
        assert!(!e.is_retryable());
        // A spent retry budget must not look retryable to callers.
        let e = ModelError::RetriesExhausted {
            attempts: 3,
            message: "status 503".into(),
        };
        assert!(!e.is_retryable());
    }

    #[test]
    fn messages_name_the_kind() {
        let e = VectorIndexError::DimensionMismatch {
            stored: 768,
            model: 384,
        };
        assert!(e.to_string().contains("768"));
        let e = SessionError::VersionConflict {
            session_id: "s1".into(),
            attempts: 3,
        };
        assert!(e.to_string().contains("s1"));
    }
}
