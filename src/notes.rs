//! Core note data model and markdown structure extraction.
//!
//! Notes are markdown files with YAML frontmatter owned by the upstream
//! note store. This module models the slice of them Brain consumes:
//! identity, typed frontmatter fields, and the `[[wikilinks]]` that
//! drive the relation graph. Frontmatter handling is deliberately
//! shallow: flat `key: value` lines only, never a full YAML parser.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A note as read from the upstream note store.
#[derive(Debug, Clone)]
pub struct Note {
    /// Stable slug identifier, e.g. `"notes/hello-world"`.
    pub permalink: String,
    pub title: String,
    pub folder: String,
    pub project: String,
    /// Frontmatter `type` (e.g. `feature`, `decision`, `bug`).
    pub note_type: Option<String>,
    /// Frontmatter `status` (e.g. `IN_PROGRESS`, `DONE`).
    pub status: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Markdown body without the frontmatter block.
    pub body: String,
}

/// A search result handed back to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextNote {
    pub note_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub score: f64,
    /// Full markdown body, populated only when enrichment is requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl Note {
    /// Wikilink targets referenced anywhere in the body.
    pub fn wikilinks(&self) -> Vec<String> {
        extract_wikilinks(&self.body)
    }
}

/// Extract `[[Target]]` wikilinks in order of appearance, deduplicated.
pub fn extract_wikilinks(text: &str) -> Vec<String> {
    let mut links = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("[[") {
        let after = &rest[open + 2..];
        match after.find("]]") {
            Some(close) => {
                let target = after[..close].trim();
                if !target.is_empty() && !links.iter().any(|l| l == target) {
                    links.push(target.to_string());
                }
                rest = &after[close + 2..];
            }
            None => break,
        }
    }
    links
}

/// Split a markdown document into flat frontmatter fields and body.
///
/// Only recognizes a leading `---` fence with `key: value` lines. A
/// document with no frontmatter returns an empty map and the full text.
pub fn parse_frontmatter(content: &str) -> (HashMap<String, String>, String) {
    let mut fields = HashMap::new();

    let Some(rest) = content.strip_prefix("---\n") else {
        return (fields, content.to_string());
    };
    let Some(end) = rest.find("\n---") else {
        return (fields, content.to_string());
    };

    for line in rest[..end].lines() {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            let value = value.trim().trim_matches('"').trim_matches('\'');
            if !key.is_empty() && !value.is_empty() {
                fields.insert(key.to_string(), value.to_string());
            }
        }
    }

    let body = rest[end + 4..].trim_start_matches('\n').to_string();
    (fields, body)
}

/// Render frontmatter fields plus body back into a markdown document.
/// Keys are written in sorted order so output is deterministic.
pub fn render_note(fields: &HashMap<String, String>, body: &str) -> String {
    let mut keys: Vec<&String> = fields.keys().collect();
    keys.sort();
    let mut out = String::from("---\n");
    for key in keys {
        out.push_str(&format!("{}: {}\n", key, fields[key]));
    }
    out.push_str("---\n\n");
    out.push_str(body);
    if !body.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Slugify a title into a permalink segment.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for ch in title.chars() {
        if ch.is_alphanumeric() {
            slug.extend(ch.to_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}
