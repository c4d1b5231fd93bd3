//! Session workflow coordinator.
//!
//! Routes the five lifecycle events to step lists over the session store.
//! Every step is idempotent (it writes absolute state, never deltas on
//! ephemeral values), so a replayed event converges instead of corrupting
//! the session. Each step runs under a timeout; a stuck store must not
//! wedge the hook that fired the event.

use crate::bootstrap::{BootstrapBuilder, BootstrapOptions};
use crate::error::WorkflowError;
use crate::protocol;
use crate::session::{AgentInvocation, SessionState, SessionStore};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const STEP_TIMEOUT_SECS: u64 = 10;
/// protocol.start builds the bootstrap document, which may wait on an
/// index catch-up check; it gets a longer budget.
const START_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    ProtocolStart {
        session_id: String,
        project: String,
    },
    StateUpdate {
        session_id: String,
        project: String,
        updates: Value,
    },
    AgentInvoked {
        session_id: String,
        project: String,
        agent: String,
        task: String,
    },
    AgentCompleted {
        session_id: String,
        project: String,
        agent: String,
        outcome: String,
    },
    ProtocolEnd {
        session_id: String,
        project: String,
        session_log: Option<PathBuf>,
    },
}

#[derive(Debug, Serialize)]
pub struct WorkflowOutcome {
    pub session: SessionState,
    /// Bootstrap context document, present only for protocol.start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

pub struct WorkflowCoordinator {
    sessions: Arc<SessionStore>,
    bootstrap: Arc<BootstrapBuilder>,
    session_log_dir: Option<PathBuf>,
}

impl WorkflowCoordinator {
    pub fn new(sessions: Arc<SessionStore>, bootstrap: Arc<BootstrapBuilder>) -> Self {
        Self {
            sessions,
            bootstrap,
            session_log_dir: None,
        }
    }

    /// Directory scanned for session-log files during protocol start.
    pub fn with_session_log_dir(mut self, dir: PathBuf) -> Self {
        self.session_log_dir = Some(dir);
        self
    }

    pub async fn handle(&self, event: SessionEvent) -> Result<WorkflowOutcome, WorkflowError> {
        match event {
            SessionEvent::ProtocolStart {
                session_id,
                project,
            } => self.on_protocol_start(&project, &session_id).await,
            SessionEvent::StateUpdate {
                session_id,
                project,
                updates,
            } => self.on_state_update(&project, &session_id, updates).await,
            SessionEvent::AgentInvoked {
                session_id,
                project,
                agent,
                task,
            } => self.on_agent_invoked(&project, &session_id, agent, task).await,
            SessionEvent::AgentCompleted {
                session_id,
                project,
                agent,
                outcome,
            } => {
                self.on_agent_completed(&project, &session_id, agent, outcome)
                    .await
            }
            SessionEvent::ProtocolEnd {
                session_id,
                project,
                session_log,
            } => self.on_protocol_end(&project, &session_id, session_log).await,
        }
    }

    /// Ensure the session exists, gather git context, build the
    /// bootstrap briefing, check for a session log, and mark the start
    /// phase complete. Re-running against an existing session reuses it.
    async fn on_protocol_start(
        &self,
        project: &str,
        session_id: &str,
    ) -> Result<WorkflowOutcome, WorkflowError> {
        let sessions = &self.sessions;
        step("ensure-session", START_TIMEOUT_SECS, async {
            match sessions.load(project, session_id).await {
                Ok(state) => Ok(state),
                Err(crate::error::SessionError::NotFound(_)) => {
                    sessions.create(project, session_id).await.map_err(WorkflowError::from)
                }
                Err(e) => Err(WorkflowError::from(e)),
            }
        })
        .await?;

        // Best-effort: a project outside a git work tree starts fine.
        let git = step("gather-git-context", STEP_TIMEOUT_SECS, async {
            Ok(git_context().await)
        })
        .await?;

        let opts = BootstrapOptions::new(project);
        let mut context = step("build-bootstrap", START_TIMEOUT_SECS, async {
            self.bootstrap
                .build(&opts)
                .await
                .map(|payload| payload.markdown)
                .map_err(|e| WorkflowError::Other(e.to_string()))
        })
        .await?;
        if let Some(git) = git {
            context.push('\n');
            context.push_str(&git);
        }

        step("check-session-log", STEP_TIMEOUT_SECS, async {
            match self.session_log_dir.as_deref() {
                Some(dir) if session_log_present(dir) => {}
                Some(dir) => {
                    tracing::warn!(
                        dir = %dir.display(),
                        session = %session_id,
                        "no session log found; create one before protocol end"
                    );
                }
                None => {
                    tracing::debug!(session = %session_id, "no session-log directory configured");
                }
            }
            Ok(())
        })
        .await?;

        let session = step("mark-start-complete", STEP_TIMEOUT_SECS, async {
            sessions
                .mutate(project, session_id, |state| {
                    state.protocol_start_complete = true;
                })
                .await
                .map_err(WorkflowError::from)
        })
        .await?;

        tracing::info!(session = %session_id, project, "protocol start complete");
        Ok(WorkflowOutcome {
            session,
            context: Some(context),
        })
    }

    /// Apply a sparse update object onto the session. Only the known
    /// mutable fields are honored; unknown keys are logged and dropped.
    async fn on_state_update(
        &self,
        project: &str,
        session_id: &str,
        updates: Value,
    ) -> Result<WorkflowOutcome, WorkflowError> {
        let session = step("apply-update", STEP_TIMEOUT_SECS, async {
            self.sessions
                .mutate(project, session_id, |state| apply_updates(state, &updates))
                .await
                .map_err(WorkflowError::from)
        })
        .await?;
        Ok(WorkflowOutcome {
            session,
            context: None,
        })
    }

    async fn on_agent_invoked(
        &self,
        project: &str,
        session_id: &str,
        agent: String,
        task: String,
    ) -> Result<WorkflowOutcome, WorkflowError> {
        let session = step("record-invocation", STEP_TIMEOUT_SECS, async {
            self.sessions
                .mutate(project, session_id, |state| {
                    let workflow = state.workflow_mut();
                    // Idempotent: a live invocation for the same agent and
                    // task is the same event redelivered.
                    let open = workflow.agent_history.iter().any(|inv| {
                        inv.agent == agent && inv.task == task && inv.completed_at.is_none()
                    });
                    if !open {
                        workflow.agent_history.push(AgentInvocation {
                            agent: agent.clone(),
                            task: task.clone(),
                            started_at: Some(Utc::now()),
                            completed_at: None,
                            outcome: None,
                        });
                    }
                })
                .await
                .map_err(WorkflowError::from)
        })
        .await?;
        Ok(WorkflowOutcome {
            session,
            context: None,
        })
    }

    async fn on_agent_completed(
        &self,
        project: &str,
        session_id: &str,
        agent: String,
        outcome: String,
    ) -> Result<WorkflowOutcome, WorkflowError> {
        let session = step("record-completion", STEP_TIMEOUT_SECS, async {
            self.sessions
                .mutate(project, session_id, |state| {
                    let workflow = state.workflow_mut();
                    if let Some(inv) = workflow
                        .agent_history
                        .iter_mut()
                        .rev()
                        .find(|inv| inv.agent == agent && inv.completed_at.is_none())
                    {
                        inv.completed_at = Some(Utc::now());
                        inv.outcome = Some(outcome.clone());
                    } else {
                        tracing::warn!(agent = %agent, session = %session_id, "completion without open invocation");
                    }
                })
                .await
                .map_err(WorkflowError::from)
        })
        .await?;
        Ok(WorkflowOutcome {
            session,
            context: None,
        })
    }

    /// Validate the session log, then mark the end phase complete. A
    /// failed validation leaves the session untouched.
    async fn on_protocol_end(
        &self,
        project: &str,
        session_id: &str,
        session_log: Option<PathBuf>,
    ) -> Result<WorkflowOutcome, WorkflowError> {
        if let Some(log) = session_log {
            let report = protocol::validate_session_log(&log);
            if !report.valid {
                return Err(WorkflowError::ProtocolValidation {
                    failed: report.failed_names(),
                });
            }
        }

        let session = step("mark-end-complete", STEP_TIMEOUT_SECS, async {
            self.sessions
                .mutate(project, session_id, |state| {
                    state.protocol_end_complete = true;
                })
                .await
                .map_err(WorkflowError::from)
        })
        .await?;
        tracing::info!(session = %session_id, project, "protocol end complete");
        Ok(WorkflowOutcome {
            session,
            context: None,
        })
    }
}

/// Branch plus recent commits as a markdown block, `None` outside a git
/// work tree.
async fn git_context() -> Option<String> {
    let branch = git_output(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    let mut block = format!("## Git Context\n\nBranch: {branch}\n");
    if let Some(log) = git_output(&["log", "--oneline", "-5"]).await {
        block.push_str(&format!("\n```\n{log}\n```\n"));
    }
    Some(block)
}

async fn git_output(args: &[&str]) -> Option<String> {
    let out = tokio::process::Command::new("git")
        .args(args)
        .output()
        .await
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&out.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn session_log_present(dir: &std::path::Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        protocol::is_session_log_filename(&entry.file_name().to_string_lossy())
    })
}

async fn step<T, F>(name: &str, seconds: u64, fut: F) -> Result<T, WorkflowError>
where
    F: Future<Output = Result<T, WorkflowError>>,
{
    match tokio::time::timeout(Duration::from_secs(seconds), fut).await {
        Ok(result) => result,
        Err(_) => Err(WorkflowError::StepTimeout {
            step: name.to_string(),
            seconds,
        }),
    }
}

fn apply_updates(state: &mut SessionState, updates: &Value) {
    let Some(map) = updates.as_object() else {
        tracing::warn!("state update payload is not an object; ignored");
        return;
    };
    for (key, value) in map {
        match key.as_str() {
            "mode" => match serde_json::from_value(value.clone()) {
                Ok(mode) => state.mode = mode,
                Err(_) => tracing::warn!(value = %value, "unknown session mode; ignored"),
            },
            "activeTask" => state.active_task = value.as_str().map(str::to_string),
            "activeFeature" => state.active_feature = value.as_str().map(str::to_string),
            "decision" => state.workflow_mut().decisions.push(value.clone()),
            "verdict" => state.workflow_mut().verdicts.push(value.clone()),
            "handoff" => state.workflow_mut().handoffs.push(value.clone()),
            other => tracing::warn!(key = other, "unknown state-update key; ignored"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionMode;
    use serde_json::json;
    use tempfile::TempDir;

    fn state() -> SessionState {
        SessionState::new("abc", "main")
    }

    #[test]
    fn apply_updates_sets_known_fields() {
        let mut s = state();
        apply_updates(
            &mut s,
            &json!({"mode": "coding", "activeTask": "wire the watcher"}),
        );
        assert_eq!(s.mode, SessionMode::Coding);
        assert_eq!(s.active_task.as_deref(), Some("wire the watcher"));
    }

    #[test]
    fn apply_updates_ignores_unknown_keys() {
        let mut s = state();
        apply_updates(&mut s, &json!({"bogus": 1, "activeFeature": "search"}));
        assert_eq!(s.active_feature.as_deref(), Some("search"));
    }

    #[test]
    fn apply_updates_accumulates_decisions() {
        let mut s = state();
        apply_updates(&mut s, &json!({"decision": "ship it"}));
        apply_updates(&mut s, &json!({"decision": "revert it"}));
        assert_eq!(s.workflow_mut().decisions.len(), 2);
    }

    #[test]
    fn bad_mode_is_dropped_not_fatal() {
        let mut s = state();
        apply_updates(&mut s, &json!({"mode": "warp-speed"}));
        assert_eq!(s.mode, SessionMode::Analysis);
    }

    #[test]
    fn session_log_presence_by_filename() {
        let tmp = TempDir::new().unwrap();
        assert!(!session_log_present(tmp.path()));

        std::fs::write(tmp.path().join("notes.md"), "scratch").unwrap();
        assert!(!session_log_present(tmp.path()));

        std::fs::write(tmp.path().join("2026-08-29-session-01.md"), "# s").unwrap();
        assert!(session_log_present(tmp.path()));

        assert!(!session_log_present(&tmp.path().join("missing")));
    }
}
