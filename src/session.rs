//! Durable session state, persisted as notes in the upstream store.
//!
//! A session lives at `sessions/session-{id}` with its body holding the
//! state document as JSON; `sessions/current-session` points at the
//! active one. Every write increments `version` and embeds an
//! HMAC-SHA-256 signature computed over the canonical (recursively
//! key-sorted, compact) JSON form minus `_signature`. Reads verify the
//! signature; legacy unsigned documents are accepted with a warning and
//! re-signed on the next write.
//!
//! Writes use optimistic locking: re-read before commit, back off
//! 100/200/400 ms on conflict, then fail with
//! [`SessionError::VersionConflict`]. In-process writers to the same
//! session are additionally serialized through a per-session mutex.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::SessionError;
use crate::store::NoteStore;

type HmacSha256 = Hmac<Sha256>;

pub const SESSIONS_FOLDER: &str = "sessions";
pub const CURRENT_SESSION_NOTE: &str = "sessions/current-session";

/// History entries kept inline after compaction.
const COMPACTION_KEEP: usize = 3;
/// History length that triggers compaction.
const COMPACTION_TRIGGER: usize = 10;

const CONFLICT_RETRIES: u32 = 3;
const CONFLICT_BACKOFF_MS: u64 = 100;

/// Session mode; `disabled` is the only gate-bypass state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    #[default]
    Analysis,
    Planning,
    Coding,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentInvocation {
    pub agent: String,
    pub task: String,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorWorkflow {
    /// Bounded to the most recent entries; older ones are compacted out.
    #[serde(default)]
    pub agent_history: Vec<AgentInvocation>,
    /// Append-only; never compacted.
    #[serde(default)]
    pub decisions: Vec<Value>,
    /// Append-only; never compacted.
    #[serde(default)]
    pub verdicts: Vec<Value>,
    #[serde(default)]
    pub handoffs: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionPointer {
    /// Permalink of the offloaded history note.
    pub note: String,
    pub moved: usize,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: String,
    /// Strictly increasing per successful write; starts at 0.
    pub version: i64,
    #[serde(rename = "_signature", skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub mode: SessionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_feature: Option<String>,
    pub project: String,
    pub protocol_start_complete: bool,
    pub protocol_end_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestrator_workflow: Option<OrchestratorWorkflow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compaction_history: Vec<CompactionPointer>,
    /// Top-level fields this build does not know about. Preserved
    /// verbatim across load, mutate, and save so a newer writer's state
    /// survives a round-trip through an older one.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl SessionState {
    pub fn new(session_id: &str, project: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            version: 0,
            signature: None,
            created_at: now,
            updated_at: now,
            mode: SessionMode::default(),
            active_task: None,
            active_feature: None,
            project: project.to_string(),
            protocol_start_complete: false,
            protocol_end_complete: false,
            orchestrator_workflow: None,
            compaction_history: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Permalink of the backing note. The id is slugified so the read
    /// path lands on the same note the title-slugging write path made.
    pub fn note_id(session_id: &str) -> String {
        format!(
            "{SESSIONS_FOLDER}/session-{}",
            crate::notes::slugify(session_id)
        )
    }

    pub fn workflow_mut(&mut self) -> &mut OrchestratorWorkflow {
        self.orchestrator_workflow.get_or_insert_with(Default::default)
    }
}

/// Serialize a JSON value canonically: object keys recursively sorted,
/// no insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&serde_json::to_string(other).expect("scalar serializes")),
    }
}

/// Sign the document (minus `_signature`) with HMAC-SHA-256, hex.
pub fn sign_document(secret: &[u8], document: &Value) -> String {
    let mut doc = document.clone();
    if let Some(map) = doc.as_object_mut() {
        map.remove("_signature");
    }
    let canonical = canonical_json(&doc);
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key size");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify an embedded `_signature`. Unsigned documents return `None`.
pub fn verify_document(secret: &[u8], document: &Value) -> Option<bool> {
    let stored = document.get("_signature")?.as_str()?.to_string();
    Some(sign_document(secret, document) == stored)
}

pub struct SessionStore {
    store: Arc<dyn NoteStore>,
    secret: Vec<u8>,
    cache: Mutex<HashMap<String, SessionState>>,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    /// Construct with the secret from `BRAIN_SESSION_SECRET`. A missing
    /// secret is a startup failure.
    pub fn new(store: Arc<dyn NoteStore>) -> Result<Self, SessionError> {
        let secret = std::env::var("BRAIN_SESSION_SECRET")
            .map_err(|_| SessionError::MissingSecret)?;
        Ok(Self::with_secret(store, secret.as_bytes()))
    }

    pub fn with_secret(store: Arc<dyn NoteStore>, secret: &[u8]) -> Self {
        Self {
            store,
            secret: secret.to_vec(),
            cache: Mutex::new(HashMap::new()),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn write_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        // Only the map holds idle entries; drop them so the registry
        // stays bounded by the set of sessions currently being written.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Load the session the current-session pointer names, if any.
    pub async fn load_current(&self, project: &str) -> Result<Option<SessionState>, SessionError> {
        let note = match self.store.read_note(project, CURRENT_SESSION_NOTE).await {
            Ok(note) => note,
            Err(_) => return Ok(None),
        };
        // The pointer body is free-form: first bare token wins, later
        // lines are tolerated for future fields.
        let Some(session_id) = note
            .body
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#'))
        else {
            return Ok(None);
        };
        Ok(Some(self.load(project, session_id).await?))
    }

    pub async fn load(&self, project: &str, session_id: &str) -> Result<SessionState, SessionError> {
        let note_id = SessionState::note_id(session_id);
        let note = self
            .store
            .read_note(project, &note_id)
            .await
            .map_err(|_| SessionError::NotFound(session_id.to_string()))?;

        let document: Value = serde_json::from_str(note.body.trim())?;
        match verify_document(&self.secret, &document) {
            Some(true) => {}
            Some(false) => {
                return Err(SessionError::Signature {
                    session_id: session_id.to_string(),
                })
            }
            None => {
                tracing::warn!(session = %session_id, "unsigned session document; will re-sign on next write");
            }
        }

        let state: SessionState = serde_json::from_value(document)?;
        self.cache
            .lock()
            .await
            .insert(session_id.to_string(), state.clone());
        Ok(state)
    }

    /// Create a session at version 0, sign it, and point
    /// `current-session` at it.
    pub async fn create(&self, project: &str, session_id: &str) -> Result<SessionState, SessionError> {
        let state = SessionState::new(session_id, project);
        let written = self.write_state(project, state).await?;
        self.store
            .write_note(project, SESSIONS_FOLDER, "current-session", &written.session_id)
            .await
            .map_err(|e| SessionError::Upstream(e.to_string()))?;
        Ok(written)
    }

    /// One optimistic write attempt: the note's stored version must
    /// still equal `state.version` (the version the caller loaded).
    pub async fn save(&self, state: &SessionState) -> Result<SessionState, SessionError> {
        let lock = self.write_lock(&state.session_id).await;
        let _guard = lock.lock().await;

        let stored_version = self.stored_version(&state.project, &state.session_id).await?;
        if let Some(v) = stored_version {
            if v != state.version {
                return Err(SessionError::VersionConflict {
                    session_id: state.session_id.clone(),
                    attempts: 1,
                });
            }
        }
        let mut next = state.clone();
        next.version = state.version + i64::from(stored_version.is_some());
        self.write_state(&state.project, next).await
    }

    /// Read-modify-write with conflict retries (100/200/400 ms).
    pub async fn mutate<F>(
        &self,
        project: &str,
        session_id: &str,
        f: F,
    ) -> Result<SessionState, SessionError>
    where
        F: Fn(&mut SessionState),
    {
        let lock = self.write_lock(session_id).await;

        for attempt in 0..=CONFLICT_RETRIES {
            if attempt > 0 {
                let delay = CONFLICT_BACKOFF_MS << (attempt - 1);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let _guard = lock.lock().await;
            let mut state = self.load(project, session_id).await?;
            let loaded_version = state.version;
            f(&mut state);
            self.compact_if_needed(project, &mut state).await?;

            // Re-read prior to commit: another writer may have advanced
            // the note since our load.
            match self.stored_version(project, session_id).await? {
                Some(v) if v != loaded_version => continue,
                _ => {}
            }

            state.version = loaded_version + 1;
            return self.write_state(project, state).await;
        }

        Err(SessionError::VersionConflict {
            session_id: session_id.to_string(),
            attempts: CONFLICT_RETRIES,
        })
    }

    /// Offload old agent history into a history note when the inline
    /// list exceeds the trigger. Decisions and verdicts stay untouched.
    async fn compact_if_needed(
        &self,
        project: &str,
        state: &mut SessionState,
    ) -> Result<(), SessionError> {
        let Some(workflow) = state.orchestrator_workflow.as_mut() else {
            return Ok(());
        };
        if workflow.agent_history.len() <= COMPACTION_TRIGGER {
            return Ok(());
        }

        let keep_from = workflow.agent_history.len() - COMPACTION_KEEP;
        let moved: Vec<AgentInvocation> = workflow.agent_history.drain(..keep_from).collect();
        let epoch = Utc::now().timestamp();
        let title = format!("session-{}-history-{}", state.session_id, epoch);
        let body = serde_json::to_string_pretty(&moved)?;

        let note = self
            .store
            .write_note(project, SESSIONS_FOLDER, &title, &body)
            .await
            .map_err(|e| SessionError::Upstream(e.to_string()))?;

        state.compaction_history.push(CompactionPointer {
            note: note.permalink,
            moved: moved.len(),
            at: Utc::now(),
        });
        Ok(())
    }

    async fn stored_version(
        &self,
        project: &str,
        session_id: &str,
    ) -> Result<Option<i64>, SessionError> {
        let note_id = SessionState::note_id(session_id);
        let note = match self.store.read_note(project, &note_id).await {
            Ok(note) => note,
            Err(_) => return Ok(None),
        };
        let document: Value = serde_json::from_str(note.body.trim())?;
        Ok(document.get("version").and_then(Value::as_i64))
    }

    async fn write_state(
        &self,
        project: &str,
        mut state: SessionState,
    ) -> Result<SessionState, SessionError> {
        state.updated_at = Utc::now();
        state.signature = None;
        let mut document = serde_json::to_value(&state)?;
        let signature = sign_document(&self.secret, &document);
        if let Some(map) = document.as_object_mut() {
            map.insert("_signature".to_string(), Value::String(signature.clone()));
        }
        state.signature = Some(signature);

        let title = format!("session-{}", state.session_id);
        let body = serde_json::to_string_pretty(&document)?;
        self.store
            .write_note(project, SESSIONS_FOLDER, &title, &body)
            .await
            .map_err(|e| SessionError::Upstream(e.to_string()))?;

        // The cache is invalidated (replaced) on every write.
        self.cache
            .lock()
            .await
            .insert(state.session_id.clone(), state.clone());
        Ok(state)
    }
}
