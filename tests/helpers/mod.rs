//! Shared test doubles: an in-memory note store and a scripted embedder.
//! Not every test binary uses every helper.
#![allow(dead_code)]

use async_trait::async_trait;
use brain::error::ModelError;
use brain::model_client::Embedder;
use brain::notes::{parse_frontmatter, slugify, Note};
use brain::store::{EditOp, NoteFilters, NoteStore};
use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// In-memory [`NoteStore`] keyed `project -> permalink -> note`. Reads
/// and writes can be failed on demand to simulate an unreachable
/// upstream store.
#[derive(Default)]
pub struct MemoryStore {
    notes: Mutex<HashMap<String, HashMap<String, Note>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail until flipped back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> anyhow::Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("note store unavailable");
        }
        Ok(())
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, Note>>> {
        self.notes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn find(&self, project: &str, identifier: &str) -> Option<Note> {
        let notes = self.guard();
        let project_notes = notes.get(project)?;
        if let Some(note) = project_notes.get(identifier) {
            return Some(note.clone());
        }
        project_notes
            .values()
            .find(|n| n.title == identifier || slugify(&n.title) == slugify(identifier))
            .cloned()
    }
}

fn build_note(project: &str, folder: &str, title: &str, content: &str) -> Note {
    let (fields, body) = parse_frontmatter(content);
    let slug = slugify(title);
    let permalink = if folder.is_empty() {
        slug
    } else {
        format!("{folder}/{slug}")
    };
    let now = Utc::now();
    Note {
        permalink,
        title: title.to_string(),
        folder: folder.to_string(),
        project: project.to_string(),
        note_type: fields.get("type").cloned(),
        status: fields.get("status").cloned(),
        tags: fields
            .get("tags")
            .map(|t| t.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default(),
        created_at: now,
        updated_at: now,
        body,
    }
}

#[async_trait]
impl NoteStore for MemoryStore {
    async fn write_note(
        &self,
        project: &str,
        folder: &str,
        title: &str,
        content: &str,
    ) -> anyhow::Result<Note> {
        self.check_available()?;
        let mut note = build_note(project, folder, title, content);
        let mut notes = self.guard();
        let project_notes = notes.entry(project.to_string()).or_default();
        if let Some(existing) = project_notes.get(&note.permalink) {
            note.created_at = existing.created_at;
        }
        project_notes.insert(note.permalink.clone(), note.clone());
        Ok(note)
    }

    async fn read_note(&self, project: &str, identifier: &str) -> anyhow::Result<Note> {
        self.check_available()?;
        self.find(project, identifier)
            .ok_or_else(|| anyhow::anyhow!("note not found: {identifier}"))
    }

    async fn edit_note(
        &self,
        project: &str,
        identifier: &str,
        op: EditOp,
    ) -> anyhow::Result<Note> {
        self.check_available()?;
        let mut note = self
            .find(project, identifier)
            .ok_or_else(|| anyhow::anyhow!("note not found: {identifier}"))?;
        note.body = match op {
            EditOp::Append(text) => format!("{}\n{text}", note.body),
            EditOp::Prepend(text) => format!("{text}\n{}", note.body),
            EditOp::FindReplace { find, replace } => note.body.replace(&find, &replace),
            EditOp::ReplaceSection { section, content } => {
                // Tests only exercise whole-body edits through the other ops.
                let _ = section;
                content
            }
        };
        note.updated_at = Utc::now();
        self.guard()
            .entry(project.to_string())
            .or_default()
            .insert(note.permalink.clone(), note.clone());
        Ok(note)
    }

    async fn delete_note(&self, project: &str, identifier: &str) -> anyhow::Result<bool> {
        self.check_available()?;
        let Some(note) = self.find(project, identifier) else {
            return Ok(false);
        };
        self.guard()
            .get_mut(project)
            .map(|notes| notes.remove(&note.permalink));
        Ok(true)
    }

    async fn list_directory(&self, project: &str, folder: &str) -> anyhow::Result<Vec<String>> {
        self.check_available()?;
        let notes = self.guard();
        let mut permalinks: Vec<String> = notes
            .get(project)
            .map(|project_notes| {
                project_notes
                    .keys()
                    .filter(|p| folder.is_empty() || p.starts_with(&format!("{folder}/")))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        permalinks.sort();
        Ok(permalinks)
    }

    async fn search_notes(
        &self,
        project: &str,
        query: &str,
        filters: &NoteFilters,
    ) -> anyhow::Result<Vec<Note>> {
        self.check_available()?;
        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let notes = self.guard();
        let mut scored: Vec<(usize, Note)> = notes
            .get(project)
            .map(|project_notes| {
                project_notes
                    .values()
                    .filter(|n| {
                        (filters.types.is_empty()
                            || n.note_type
                                .as_deref()
                                .map(|t| filters.types.iter().any(|f| f == t))
                                .unwrap_or(false))
                            && filters.after_date.map(|d| n.updated_at >= d).unwrap_or(true)
                    })
                    .filter_map(|n| {
                        let title = n.title.to_lowercase();
                        let body = n.body.to_lowercase();
                        let score: usize = terms
                            .iter()
                            .map(|t| {
                                title.matches(t.as_str()).count() * 3
                                    + body.matches(t.as_str()).count()
                            })
                            .sum();
                        (score > 0).then(|| (score, n.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.permalink.cmp(&b.1.permalink)));
        let mut results: Vec<Note> = scored.into_iter().map(|(_, n)| n).collect();
        results.truncate(filters.page_size.unwrap_or(20));
        Ok(results)
    }

    async fn resolve(&self, project: &str, target: &str) -> anyhow::Result<Option<Note>> {
        self.check_available()?;
        Ok(self.find(project, target))
    }
}

/// Deterministic [`Embedder`]: each text hashes to a stable unit vector,
/// with per-text overrides so tests can control similarity. Failures and
/// dimension drift can be injected.
pub struct ScriptedEmbedder {
    dims: usize,
    overrides: Mutex<HashMap<String, Vec<f32>>>,
    pub calls: AtomicUsize,
    fail: AtomicBool,
}

impl ScriptedEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            overrides: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Pin the vector returned for a text (matched without its prefix).
    pub fn with_vector(self, text: &str, vector: Vec<f32>) -> Self {
        self.overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(text.to_string(), vector);
        self
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self
            .overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(text)
        {
            return v.clone();
        }
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let mut seed = hasher.finish();
        let mut vector = Vec::with_capacity(self.dims);
        for _ in 0..self.dims {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            vector.push(((seed >> 33) as f32 / u32::MAX as f32) - 0.5);
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for ScriptedEmbedder {
    fn model_name(&self) -> &str {
        "scripted-test-model"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        _task_prefix: &str,
    ) -> Result<Vec<Vec<f32>>, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ModelError::Retryable {
                status: Some(503),
                message: "scripted failure".to_string(),
            });
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}
