//! Hook contract layer: the only operations external hook binaries may
//! invoke. Everything is JSON-in/JSON-out with exit-code discipline
//! (0 success, 1 error, 2 warning); a non-zero result never leaves
//! partial state behind.

use crate::bootstrap::{BootstrapBuilder, BootstrapOptions};
use crate::protocol::{self, ValidationReport};
use crate::session::{SessionMode, SessionStore};
use crate::workflow::{SessionEvent, WorkflowCoordinator};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_WARNING: i32 = 2;

/// Tools that only observe. Anything not listed is treated as
/// destructive; an unknown tool must not slip past the gate.
const READ_ONLY_TOOLS: &[&str] = &[
    "Read",
    "Grep",
    "Glob",
    "LS",
    "NotebookRead",
    "WebFetch",
    "WebSearch",
    "TodoRead",
];

pub fn is_read_only_tool(tool: &str) -> bool {
    READ_ONLY_TOOLS.contains(&tool)
}

#[derive(Debug, Clone, Serialize)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: String,
    pub mode: String,
}

/// Result of one hook operation: a JSON body plus the process exit code
/// the hook binary should use.
#[derive(Debug, Clone, Serialize)]
pub struct HookOutput {
    pub exit_code: i32,
    pub body: Value,
}

impl HookOutput {
    fn ok(body: Value) -> Self {
        Self {
            exit_code: EXIT_OK,
            body,
        }
    }

    fn warning(body: Value) -> Self {
        Self {
            exit_code: EXIT_WARNING,
            body,
        }
    }

    fn error(message: impl std::fmt::Display) -> Self {
        Self {
            exit_code: EXIT_ERROR,
            body: json!({ "error": message.to_string() }),
        }
    }
}

pub struct HookService {
    sessions: Arc<SessionStore>,
    workflow: Arc<WorkflowCoordinator>,
    bootstrap: Arc<BootstrapBuilder>,
}

impl HookService {
    pub fn new(
        sessions: Arc<SessionStore>,
        workflow: Arc<WorkflowCoordinator>,
        bootstrap: Arc<BootstrapBuilder>,
    ) -> Self {
        Self {
            sessions,
            workflow,
            bootstrap,
        }
    }

    /// Current session state as JSON, or `null` when no session exists.
    pub async fn session_state_get(&self, project: &str) -> HookOutput {
        match self.sessions.load_current(project).await {
            Ok(Some(state)) => match serde_json::to_value(&state) {
                Ok(body) => HookOutput::ok(body),
                Err(e) => HookOutput::error(e),
            },
            Ok(None) => HookOutput::ok(Value::Null),
            Err(e) => HookOutput::error(e),
        }
    }

    /// Apply a sparse update to the current session via the workflow
    /// coordinator.
    pub async fn session_state_set(&self, project: &str, updates: Value) -> HookOutput {
        let session_id = match self.sessions.load_current(project).await {
            Ok(Some(state)) => state.session_id,
            Ok(None) => return HookOutput::error("no active session to update"),
            Err(e) => return HookOutput::error(e),
        };
        let event = SessionEvent::StateUpdate {
            session_id,
            project: project.to_string(),
            updates,
        };
        match self.workflow.handle(event).await {
            Ok(outcome) => match serde_json::to_value(&outcome.session) {
                Ok(body) => HookOutput::ok(body),
                Err(e) => HookOutput::error(e),
            },
            Err(e) => HookOutput::error(e),
        }
    }

    /// Classify a tool and decide whether the gate admits it. Never
    /// fails: an unreadable session yields a fail-closed decision.
    pub async fn gate_check(&self, project: &str, tool: &str) -> GateDecision {
        if is_read_only_tool(tool) {
            return GateDecision {
                allowed: true,
                reason: format!("'{tool}' is read-only"),
                mode: self.current_mode(project).await,
            };
        }

        match self.sessions.load_current(project).await {
            Ok(Some(state)) => {
                let mode = mode_str(state.mode);
                if state.mode == SessionMode::Disabled {
                    GateDecision {
                        allowed: true,
                        reason: "session protocol disabled".to_string(),
                        mode,
                    }
                } else if state.protocol_start_complete {
                    GateDecision {
                        allowed: true,
                        reason: "session protocol active".to_string(),
                        mode,
                    }
                } else {
                    GateDecision {
                        allowed: false,
                        reason: "session protocol not started".to_string(),
                        mode,
                    }
                }
            }
            Ok(None) => GateDecision {
                allowed: false,
                reason: "no active session".to_string(),
                mode: "unknown".to_string(),
            },
            Err(e) => {
                tracing::warn!(error = %e, tool, "gate check could not read session state");
                GateDecision {
                    allowed: false,
                    reason: "session state unreadable".to_string(),
                    mode: "unknown".to_string(),
                }
            }
        }
    }

    /// Gate check wrapped in exit-code discipline: blocked tools exit 2.
    pub async fn gate_check_output(&self, project: &str, tool: &str) -> HookOutput {
        let decision = self.gate_check(project, tool).await;
        let body = serde_json::to_value(&decision).unwrap_or(Value::Null);
        if decision.allowed {
            HookOutput::ok(body)
        } else {
            HookOutput::warning(body)
        }
    }

    pub async fn bootstrap_get(&self, project: &str) -> HookOutput {
        let opts = BootstrapOptions::new(project);
        match self.bootstrap.build(&opts).await {
            Ok(payload) => match serde_json::to_value(&payload) {
                Ok(body) => HookOutput::ok(body),
                Err(e) => HookOutput::error(e),
            },
            Err(e) => HookOutput::error(e),
        }
    }

    /// Run the session-log validator. An invalid log exits 1; the report
    /// body carries the per-check detail either way.
    pub fn validate_session(&self, log_path: &Path) -> (ValidationReport, HookOutput) {
        let report = protocol::validate_session_log(log_path);
        let body = serde_json::to_value(&report).unwrap_or(Value::Null);
        let output = if report.valid {
            HookOutput::ok(body)
        } else {
            HookOutput {
                exit_code: EXIT_ERROR,
                body,
            }
        };
        (report, output)
    }

    async fn current_mode(&self, project: &str) -> String {
        match self.sessions.load_current(project).await {
            Ok(Some(state)) => mode_str(state.mode),
            _ => "unknown".to_string(),
        }
    }
}

fn mode_str(mode: SessionMode) -> String {
    match mode {
        SessionMode::Analysis => "analysis",
        SessionMode::Planning => "planning",
        SessionMode::Coding => "coding",
        SessionMode::Disabled => "disabled",
    }
    .to_string()
}
