//! Upstream note store (UNS) client seam.
//!
//! Brain consumes a markdown-backed knowledge store but never owns it.
//! [`NoteStore`] pins the exact contract relied on (§ write/read/edit/
//! delete/list/search); [`MarkdownStore`] is the local adapter that
//! speaks it against the store's on-disk markdown roots. Listings are
//! eventually consistent and the adapter never mutates frontmatter
//! beyond the contract fields.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use walkdir::WalkDir;

use crate::notes::{parse_frontmatter, render_note, slugify, Note};

/// Edit operations supported by the upstream `edit_note` tool.
#[derive(Debug, Clone)]
pub enum EditOp {
    Append(String),
    Prepend(String),
    FindReplace { find: String, replace: String },
    ReplaceSection { section: String, content: String },
}

/// Filters accepted by the upstream keyword search.
#[derive(Debug, Clone, Default)]
pub struct NoteFilters {
    pub types: Vec<String>,
    pub after_date: Option<DateTime<Utc>>,
    pub page_size: Option<usize>,
}

pub const DEFAULT_PAGE_SIZE: usize = 20;

/// The upstream note store contract.
#[async_trait]
pub trait NoteStore: Send + Sync {
    /// Create or replace a note. `content` may be a full document with
    /// frontmatter or a bare body; bare bodies get minimal frontmatter.
    async fn write_note(&self, project: &str, folder: &str, title: &str, content: &str)
        -> Result<Note>;

    /// Read a note by permalink or title.
    async fn read_note(&self, project: &str, identifier: &str) -> Result<Note>;

    async fn edit_note(&self, project: &str, identifier: &str, op: EditOp) -> Result<Note>;

    /// Returns true if the note existed.
    async fn delete_note(&self, project: &str, identifier: &str) -> Result<bool>;

    /// Permalinks under a folder, sorted. Empty folder lists the project.
    async fn list_directory(&self, project: &str, folder: &str) -> Result<Vec<String>>;

    /// Ranked keyword search over titles and bodies.
    async fn search_notes(&self, project: &str, query: &str, filters: &NoteFilters)
        -> Result<Vec<Note>>;

    /// Resolve a wikilink target (title or permalink) to a note.
    async fn resolve(&self, project: &str, target: &str) -> Result<Option<Note>>;
}

/// Adapter over the note store's markdown roots, one root per project.
pub struct MarkdownStore {
    roots: RwLock<HashMap<String, PathBuf>>,
    markdown: GlobSet,
}

impl MarkdownStore {
    pub fn new(roots: HashMap<String, PathBuf>) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        builder.add(Glob::new("**/*.md")?);
        Ok(Self {
            roots: RwLock::new(roots),
            markdown: builder.build()?,
        })
    }

    /// Swap project roots after a reconfiguration.
    pub fn set_roots(&self, roots: HashMap<String, PathBuf>) {
        *self.roots.write().expect("roots lock poisoned") = roots;
    }

    fn root_for(&self, project: &str) -> Result<PathBuf> {
        self.roots
            .read()
            .expect("roots lock poisoned")
            .get(project)
            .cloned()
            .with_context(|| format!("unknown project: {project}"))
    }

    fn load_note(&self, project: &str, root: &Path, path: &Path) -> Result<Note> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read note: {}", path.display()))?;
        let relative = path.strip_prefix(root).unwrap_or(path);
        let permalink = relative
            .with_extension("")
            .to_string_lossy()
            .replace('\\', "/");
        let folder = permalink
            .rsplit_once('/')
            .map(|(dir, _)| dir.to_string())
            .unwrap_or_default();

        let (fields, body) = parse_frontmatter(&content);

        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        let modified_secs = modified
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let fallback = Utc
            .timestamp_opt(modified_secs, 0)
            .single()
            .unwrap_or_else(Utc::now);

        let title = fields
            .get("title")
            .cloned()
            .or_else(|| {
                body.lines()
                    .find_map(|l| l.strip_prefix("# ").map(|t| t.trim().to_string()))
            })
            .unwrap_or_else(|| {
                permalink
                    .rsplit('/')
                    .next()
                    .unwrap_or(&permalink)
                    .to_string()
            });

        Ok(Note {
            permalink,
            title,
            folder,
            project: project.to_string(),
            note_type: fields.get("type").cloned(),
            status: fields.get("status").cloned(),
            tags: fields
                .get("tags")
                .map(|t| {
                    t.trim_matches(['[', ']'])
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            created_at: parse_date(fields.get("created")).unwrap_or(fallback),
            updated_at: parse_date(fields.get("updated")).unwrap_or(fallback),
            body,
        })
    }

    fn find_note(&self, project: &str, identifier: &str) -> Result<Option<(PathBuf, PathBuf)>> {
        let root = self.root_for(project)?;

        // Fast path: identifier is a permalink.
        let direct = root.join(format!("{identifier}.md"));
        if direct.is_file() {
            return Ok(Some((root, direct)));
        }

        // Slow path: match by title or slug.
        let want_slug = slugify(identifier);
        for entry in WalkDir::new(&root).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
            if !self.markdown.is_match(rel.to_string_lossy().as_ref()) {
                continue;
            }
            if let Ok(note) = self.load_note(project, &root, entry.path()) {
                if note.title == identifier || slugify(&note.title) == want_slug {
                    return Ok(Some((root, entry.path().to_path_buf())));
                }
            }
        }
        Ok(None)
    }

    fn scan(&self, project: &str, folder: &str) -> Result<Vec<(PathBuf, PathBuf)>> {
        let root = self.root_for(project)?;
        let base = if folder.is_empty() {
            root.clone()
        } else {
            root.join(folder)
        };
        if !base.exists() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in WalkDir::new(&base).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
            if self.markdown.is_match(rel.to_string_lossy().as_ref()) {
                paths.push((root.clone(), entry.path().to_path_buf()));
            }
        }
        // Deterministic ordering for stable listings.
        paths.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(paths)
    }
}

fn parse_date(value: Option<&String>) -> Option<DateTime<Utc>> {
    let value = value?;
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|d| d.and_utc())
        })
}

#[async_trait]
impl NoteStore for MarkdownStore {
    async fn write_note(
        &self,
        project: &str,
        folder: &str,
        title: &str,
        content: &str,
    ) -> Result<Note> {
        let root = self.root_for(project)?;
        let slug = slugify(title);
        if slug.is_empty() {
            bail!("note title produces an empty permalink: {title:?}");
        }
        let permalink = if folder.is_empty() {
            slug
        } else {
            format!("{folder}/{slug}")
        };
        let path = root.join(format!("{permalink}.md"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let document = if content.starts_with("---\n") {
            content.to_string()
        } else {
            let mut fields = HashMap::new();
            fields.insert("title".to_string(), title.to_string());
            fields.insert("permalink".to_string(), permalink.clone());
            fields.insert("updated".to_string(), Utc::now().to_rfc3339());
            render_note(&fields, content)
        };

        std::fs::write(&path, document)?;
        self.load_note(project, &root, &path)
    }

    async fn read_note(&self, project: &str, identifier: &str) -> Result<Note> {
        match self.find_note(project, identifier)? {
            Some((root, path)) => self.load_note(project, &root, &path),
            None => bail!("note not found: {identifier}"),
        }
    }

    async fn edit_note(&self, project: &str, identifier: &str, op: EditOp) -> Result<Note> {
        let Some((root, path)) = self.find_note(project, identifier)? else {
            bail!("note not found: {identifier}");
        };
        let content = std::fs::read_to_string(&path)?;
        let (fields, body) = parse_frontmatter(&content);

        let new_body = match op {
            EditOp::Append(text) => format!("{body}\n{text}"),
            EditOp::Prepend(text) => format!("{text}\n{body}"),
            EditOp::FindReplace { find, replace } => body.replace(&find, &replace),
            EditOp::ReplaceSection { section, content } => {
                replace_section(&body, &section, &content)
            }
        };

        let document = if fields.is_empty() {
            new_body.clone()
        } else {
            render_note(&fields, &new_body)
        };
        std::fs::write(&path, document)?;
        self.load_note(project, &root, &path)
    }

    async fn delete_note(&self, project: &str, identifier: &str) -> Result<bool> {
        match self.find_note(project, identifier)? {
            Some((_, path)) => {
                std::fs::remove_file(path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_directory(&self, project: &str, folder: &str) -> Result<Vec<String>> {
        let entries = self.scan(project, folder)?;
        Ok(entries
            .into_iter()
            .map(|(root, path)| {
                path.strip_prefix(&root)
                    .unwrap_or(&path)
                    .with_extension("")
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect())
    }

    async fn search_notes(
        &self,
        project: &str,
        query: &str,
        filters: &NoteFilters,
    ) -> Result<Vec<Note>> {
        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let mut scored: Vec<(f64, Note)> = Vec::new();
        for (root, path) in self.scan(project, "")? {
            let Ok(note) = self.load_note(project, &root, &path) else {
                continue;
            };

            if !filters.types.is_empty() {
                let Some(ref t) = note.note_type else { continue };
                if !filters.types.iter().any(|f| f == t) {
                    continue;
                }
            }
            if let Some(after) = filters.after_date {
                if note.updated_at < after {
                    continue;
                }
            }

            let title = note.title.to_lowercase();
            let body = note.body.to_lowercase();
            let mut score = 0.0;
            for term in &terms {
                score += 3.0 * title.matches(term.as_str()).count() as f64;
                score += body.matches(term.as_str()).count() as f64;
            }
            // With an empty query the filters alone select notes.
            if terms.is_empty() {
                score = 1.0;
            }
            if score > 0.0 {
                scored.push((score, note));
            }
        }

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.updated_at.cmp(&a.1.updated_at))
                .then(a.1.permalink.cmp(&b.1.permalink))
        });
        scored.truncate(filters.page_size.unwrap_or(DEFAULT_PAGE_SIZE));
        Ok(scored.into_iter().map(|(_, n)| n).collect())
    }

    async fn resolve(&self, project: &str, target: &str) -> Result<Option<Note>> {
        match self.find_note(project, target)? {
            Some((root, path)) => Ok(Some(self.load_note(project, &root, &path)?)),
            None => Ok(None),
        }
    }
}

/// Replace a `## section` block, from its heading to the next heading of
/// the same or higher level. Appends the section if it is absent.
fn replace_section(body: &str, section: &str, content: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut in_section = false;
    let mut replaced = false;
    let mut section_level = 0;

    for line in body.lines() {
        let trimmed = line.trim_start();
        let level = trimmed.chars().take_while(|c| *c == '#').count();
        let heading = trimmed.trim_start_matches('#').trim();

        if in_section {
            if level > 0 && level <= section_level {
                in_section = false;
                out.push(line.to_string());
            }
            continue;
        }

        if level > 0 && heading.eq_ignore_ascii_case(section) {
            in_section = true;
            replaced = true;
            section_level = level;
            out.push(line.to_string());
            out.push(content.trim_end().to_string());
            continue;
        }

        out.push(line.to_string());
    }

    if !replaced {
        out.push(format!("## {section}"));
        out.push(content.trim_end().to_string());
    }
    out.join("\n")
}
