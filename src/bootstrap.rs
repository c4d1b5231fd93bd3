//! Bootstrap context builder.
//!
//! Composes the session-initialization payload: feature/decision/bug
//! digests over the note corpus, recent activity, and the notes those
//! sections reference. Returned as one markdown string plus a structured
//! companion object. Always kicks off a background embedding catch-up;
//! the fast path costs milliseconds when nothing is pending.

use crate::notes::Note;
use crate::pipeline::EmbeddingPipeline;
use crate::store::{NoteStore, DEFAULT_PAGE_SIZE};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

const DEFAULT_TIMEFRAME: &str = "5d";
const DEFAULT_DEPTH: usize = 3;

#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    pub project: String,
    /// Lookback window, e.g. `5d`, `12h`, `30m`.
    pub timeframe: String,
    /// Reference-chasing hops for the Referenced Notes section.
    pub depth: usize,
    pub full_content: bool,
}

impl BootstrapOptions {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            timeframe: DEFAULT_TIMEFRAME.to_string(),
            depth: DEFAULT_DEPTH,
            full_content: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteRef {
    pub permalink: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl NoteRef {
    fn from_note(note: &Note, full_content: bool) -> Self {
        Self {
            permalink: note.permalink.clone(),
            title: note.title.clone(),
            note_type: note.note_type.clone(),
            status: note.status.clone(),
            content: full_content.then(|| note.body.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapSections {
    pub active_features: Vec<NoteRef>,
    pub recent_decisions: Vec<NoteRef>,
    pub open_bugs: Vec<NoteRef>,
    pub recent_activity: Vec<NoteRef>,
    pub referenced_notes: Vec<NoteRef>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapPayload {
    pub project: String,
    pub generated_at: DateTime<Utc>,
    pub markdown: String,
    pub sections: BootstrapSections,
}

/// Parse a compact timeframe (`5d`, `12h`, `30m`). Unparseable input
/// falls back to the default window.
pub fn parse_timeframe(s: &str) -> Duration {
    let fallback = Duration::days(5);
    let s = s.trim();
    if s.len() < 2 {
        return fallback;
    }
    let (num, unit) = s.split_at(s.len() - 1);
    let Ok(n) = num.parse::<i64>() else {
        return fallback;
    };
    match unit {
        "d" => Duration::days(n),
        "h" => Duration::hours(n),
        "m" => Duration::minutes(n),
        _ => fallback,
    }
}

pub struct BootstrapBuilder {
    store: Arc<dyn NoteStore>,
    pipeline: Arc<EmbeddingPipeline>,
}

impl BootstrapBuilder {
    pub fn new(store: Arc<dyn NoteStore>, pipeline: Arc<EmbeddingPipeline>) -> Self {
        Self { store, pipeline }
    }

    pub async fn build(&self, opts: &BootstrapOptions) -> Result<BootstrapPayload> {
        self.spawn_catch_up(&opts.project);

        let cutoff = Utc::now() - parse_timeframe(&opts.timeframe);
        let notes = self.load_all(&opts.project).await?;

        let mut sections = BootstrapSections::default();
        for note in &notes {
            let ty = note.note_type.as_deref().unwrap_or("");
            let status = note.status.as_deref().unwrap_or("");
            let recent = note.updated_at >= cutoff;

            if ty == "feature" && recent && matches!(status, "IN_PROGRESS" | "NOT_STARTED") {
                sections
                    .active_features
                    .push(NoteRef::from_note(note, opts.full_content));
            }
            if ty == "decision" && recent {
                sections
                    .recent_decisions
                    .push(NoteRef::from_note(note, opts.full_content));
            }
            if ty == "bug" && status != "DONE" {
                sections
                    .open_bugs
                    .push(NoteRef::from_note(note, opts.full_content));
            }
            if recent && sections.recent_activity.len() < DEFAULT_PAGE_SIZE {
                sections
                    .recent_activity
                    .push(NoteRef::from_note(note, opts.full_content));
            }
        }

        sections.referenced_notes = self
            .chase_references(&opts.project, &notes, &sections, opts)
            .await;

        let markdown = render_markdown(&opts.project, &sections, opts.full_content);
        Ok(BootstrapPayload {
            project: opts.project.clone(),
            generated_at: Utc::now(),
            markdown,
            sections,
        })
    }

    async fn load_all(&self, project: &str) -> Result<Vec<Note>> {
        let permalinks = self.store.list_directory(project, "").await?;
        let mut notes = Vec::with_capacity(permalinks.len());
        for permalink in permalinks {
            match self.store.resolve(project, &permalink).await {
                Ok(Some(note)) => notes.push(note),
                Ok(None) => {}
                Err(err) => tracing::warn!(note = %permalink, error = %err, "bootstrap: note unreadable"),
            }
        }
        // Newest first so section caps keep the most recent entries.
        notes.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(notes)
    }

    /// Follow wikilinks out of the section notes, up to `depth` hops,
    /// skipping notes already listed in a section.
    async fn chase_references(
        &self,
        project: &str,
        corpus: &[Note],
        sections: &BootstrapSections,
        opts: &BootstrapOptions,
    ) -> Vec<NoteRef> {
        let mut seen: HashSet<String> = sections
            .active_features
            .iter()
            .chain(&sections.recent_decisions)
            .chain(&sections.open_bugs)
            .chain(&sections.recent_activity)
            .map(|r| r.permalink.clone())
            .collect();

        let mut targets: Vec<String> = corpus
            .iter()
            .filter(|n| seen.contains(&n.permalink))
            .flat_map(|n| n.wikilinks())
            .collect();
        let mut referenced = Vec::new();

        for _hop in 0..opts.depth {
            if targets.is_empty() || referenced.len() >= DEFAULT_PAGE_SIZE {
                break;
            }
            let mut next_targets = Vec::new();
            for target in targets {
                if referenced.len() >= DEFAULT_PAGE_SIZE {
                    break;
                }
                let resolved = match self.store.resolve(project, &target).await {
                    Ok(r) => r,
                    Err(err) => {
                        tracing::debug!(target = %target, error = %err, "bootstrap: reference unresolved");
                        None
                    }
                };
                let Some(note) = resolved else { continue };
                if !seen.insert(note.permalink.clone()) {
                    continue;
                }
                next_targets.extend(note.wikilinks());
                referenced.push(NoteRef::from_note(&note, opts.full_content));
            }
            targets = next_targets;
        }
        referenced
    }

    /// Fire-and-forget catch-up. Failures log at warn; the next
    /// bootstrap retries.
    fn spawn_catch_up(&self, project: &str) {
        let pipeline = Arc::clone(&self.pipeline);
        let project = project.to_string();
        tokio::spawn(async move {
            let report = pipeline.catch_up_project(&project).await;
            tracing::info!(
                project = %project,
                embedded = report.embedded,
                skipped = report.skipped,
                deleted = report.deleted,
                failed = report.failed.len(),
                halted = report.halted.is_some(),
                "bootstrap catch-up complete"
            );
        });
    }
}

fn render_markdown(project: &str, sections: &BootstrapSections, full_content: bool) -> String {
    let mut doc = String::new();
    let _ = writeln!(doc, "# Brain Bootstrap: {project}");

    render_section(&mut doc, "Active Features", &sections.active_features, full_content);
    render_section(&mut doc, "Recent Decisions", &sections.recent_decisions, full_content);
    render_section(&mut doc, "Open Bugs", &sections.open_bugs, full_content);
    render_section(&mut doc, "Recent Activity", &sections.recent_activity, full_content);
    render_section(&mut doc, "Referenced Notes", &sections.referenced_notes, full_content);
    doc
}

fn render_section(doc: &mut String, heading: &str, refs: &[NoteRef], full_content: bool) {
    if refs.is_empty() {
        return;
    }
    let _ = writeln!(doc, "\n## {heading}");
    for r in refs {
        let status = r
            .status
            .as_deref()
            .map(|s| format!(" ({s})"))
            .unwrap_or_default();
        let _ = writeln!(doc, "- [[{}]]{status}", r.title);
        if full_content {
            if let Some(body) = &r.content {
                let _ = writeln!(doc, "\n{}\n", body.trim());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_units() {
        assert_eq!(parse_timeframe("5d"), Duration::days(5));
        assert_eq!(parse_timeframe("12h"), Duration::hours(12));
        assert_eq!(parse_timeframe("30m"), Duration::minutes(30));
    }

    #[test]
    fn bad_timeframe_falls_back_to_five_days() {
        assert_eq!(parse_timeframe(""), Duration::days(5));
        assert_eq!(parse_timeframe("soon"), Duration::days(5));
        assert_eq!(parse_timeframe("5w"), Duration::days(5));
    }

    #[test]
    fn empty_sections_render_no_headings() {
        let doc = render_markdown("main", &BootstrapSections::default(), false);
        assert_eq!(doc.trim(), "# Brain Bootstrap: main");
    }
}
