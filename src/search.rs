//! Unified search over the vector index and the upstream note store.
//!
//! Four modes: `semantic` (query embedding → cosine ANN), `keyword`
//! (upstream ranked search), `auto` (semantic with a silent keyword
//! fallback when the project has no embeddings), and `hybrid` (union of
//! both, rescored by the max of the two channels with semantic winning
//! ties). Primary results can then be expanded along the wikilink
//! relation graph and enriched with full note bodies.
//!
//! An embedding failure never fails a query: semantic and hybrid
//! degrade to keyword for that call with a warning. The upstream store
//! being unreachable is fatal ([`SearchError::UpstreamUnavailable`]).

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::SearchError;
use crate::guard;
use crate::index::VectorIndex;
use crate::model_client::{Embedder, TASK_PREFIX_QUERY};
use crate::notes::{ContextNote, Note};
use crate::store::{NoteFilters, NoteStore};

/// Expanded results are capped at this multiple of `limit`.
const EXPANSION_CAP_FACTOR: usize = 3;

/// Keyword rank→score ceiling, kept under the default semantic
/// threshold so a keyword hit never outranks a strong semantic hit.
const KEYWORD_SCORE_CEILING: f64 = 0.69;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    #[default]
    Auto,
    Semantic,
    Keyword,
    Hybrid,
}

impl SearchMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "semantic" => Some(Self::Semantic),
            "keyword" => Some(Self::Keyword),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub project: String,
    pub limit: usize,
    pub mode: SearchMode,
    pub threshold: f64,
    /// Relation-graph hops to add after primary results.
    pub depth: usize,
    /// Populate `content` with full note bodies (after expansion).
    pub full_content: bool,
    pub types: Vec<String>,
    pub after_date: Option<DateTime<Utc>>,
}

impl SearchOptions {
    pub fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            limit: 10,
            mode: SearchMode::Auto,
            threshold: 0.7,
            depth: 0,
            full_content: false,
            types: Vec::new(),
            after_date: None,
        }
    }
}

struct Candidate {
    note: Note,
    score: f64,
    semantic: bool,
}

pub struct SearchService {
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    store: Arc<dyn NoteStore>,
}

impl SearchService {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorIndex>,
        store: Arc<dyn NoteStore>,
    ) -> Self {
        Self {
            embedder,
            index,
            store,
        }
    }

    pub async fn search(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<ContextNote>, SearchError> {
        if let Err(reason) = guard::check_query(query) {
            tracing::warn!(query, reason, "query rejected by input guard");
            return Err(SearchError::GuardRejected(reason));
        }

        let mode = self.resolve_mode(opts).await?;

        let semantic = if matches!(mode, SearchMode::Semantic | SearchMode::Hybrid) {
            match self.semantic_candidates(query, opts).await {
                Ok(hits) => Some(hits),
                Err(SearchError::Index(e)) => return Err(SearchError::Index(e)),
                Err(e) => {
                    tracing::warn!(error = %e, "semantic channel failed; downgrading to keyword");
                    None
                }
            }
        } else {
            None
        };

        let keyword = if matches!(mode, SearchMode::Keyword | SearchMode::Hybrid)
            || semantic.is_none()
        {
            Some(self.keyword_candidates(query, opts).await?)
        } else {
            None
        };

        // Union keyed by note id; score is the max of both channels and
        // a semantic hit wins ties.
        let mut merged: HashMap<String, Candidate> = HashMap::new();
        for cand in semantic.into_iter().flatten() {
            merged.insert(cand.note.permalink.clone(), cand);
        }
        for cand in keyword.into_iter().flatten() {
            match merged.get_mut(&cand.note.permalink) {
                Some(existing) => {
                    if cand.score > existing.score {
                        existing.score = cand.score;
                    }
                }
                None => {
                    merged.insert(cand.note.permalink.clone(), cand);
                }
            }
        }

        let mut primary: Vec<Candidate> = merged.into_values().collect();
        primary.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.semantic.cmp(&a.semantic))
                .then(a.note.permalink.cmp(&b.note.permalink))
        });
        primary.truncate(opts.limit);

        let mut results: Vec<(Note, f64)> =
            primary.into_iter().map(|c| (c.note, c.score)).collect();

        if opts.depth > 0 {
            self.expand_relations(&mut results, opts).await;
        }

        // Enrichment runs after expansion so expanded hits get content too.
        let mut out = Vec::with_capacity(results.len());
        for (note, score) in results {
            let content = if opts.full_content {
                match self.store.read_note(&opts.project, &note.permalink).await {
                    Ok(full) => Some(full.body),
                    Err(_) => Some(note.body.clone()),
                }
            } else {
                None
            };
            out.push(ContextNote {
                note_id: note.permalink,
                title: note.title,
                note_type: note.note_type,
                status: note.status,
                score,
                content,
            });
        }
        Ok(out)
    }

    async fn resolve_mode(&self, opts: &SearchOptions) -> Result<SearchMode, SearchError> {
        if opts.mode != SearchMode::Auto {
            return Ok(opts.mode);
        }
        let count = self.index.count_vectors(&opts.project).await?;
        Ok(if count == 0 {
            SearchMode::Keyword
        } else {
            SearchMode::Semantic
        })
    }

    async fn semantic_candidates(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<Candidate>, SearchError> {
        let query_vec = self
            .embedder
            .embed_one(query, TASK_PREFIX_QUERY)
            .await
            .map_err(|e| SearchError::UpstreamUnavailable(e.to_string()))?;

        let hits = self
            .index
            .search_ann(&query_vec, &opts.project, opts.limit, opts.threshold)
            .await?;

        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            let note = match self.store.read_note(&opts.project, &hit.note_id).await {
                Ok(note) => note,
                Err(e) => {
                    // Index row outlived its note; listings are
                    // eventually consistent.
                    tracing::debug!(note = %hit.note_id, error = %e, "semantic hit has no note");
                    continue;
                }
            };
            if !note_passes_filters(&note, opts) {
                continue;
            }
            out.push(Candidate {
                note,
                score: hit.score,
                semantic: true,
            });
        }
        Ok(out)
    }

    async fn keyword_candidates(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<Candidate>, SearchError> {
        let filters = NoteFilters {
            types: opts.types.clone(),
            after_date: opts.after_date,
            page_size: Some(opts.limit),
        };
        let notes = self
            .store
            .search_notes(&opts.project, query, &filters)
            .await
            .map_err(|e| SearchError::UpstreamUnavailable(e.to_string()))?;

        Ok(notes
            .into_iter()
            .enumerate()
            .map(|(rank, note)| Candidate {
                note,
                score: keyword_rank_score(rank),
                semantic: false,
            })
            .collect())
    }

    /// Add up to `depth`-hop wikilink neighbours of the primary results,
    /// never duplicating a note, capped at `EXPANSION_CAP_FACTOR × limit`.
    async fn expand_relations(&self, results: &mut Vec<(Note, f64)>, opts: &SearchOptions) {
        let cap = opts.limit * EXPANSION_CAP_FACTOR;
        let mut seen: HashSet<String> = results.iter().map(|(n, _)| n.permalink.clone()).collect();
        let mut frontier: Vec<(Note, f64)> = results.clone();

        for _hop in 0..opts.depth {
            let mut next: Vec<(Note, f64)> = Vec::new();
            for (note, score) in &frontier {
                for target in note.wikilinks() {
                    if results.len() >= cap {
                        return;
                    }
                    let resolved = match self.store.resolve(&opts.project, &target).await {
                        Ok(Some(n)) => n,
                        _ => continue,
                    };
                    if !seen.insert(resolved.permalink.clone()) {
                        continue;
                    }
                    results.push((resolved.clone(), score * 0.5));
                    next.push((resolved, score * 0.5));
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
    }
}

fn note_passes_filters(note: &Note, opts: &SearchOptions) -> bool {
    if !opts.types.is_empty() {
        match &note.note_type {
            Some(t) if opts.types.iter().any(|f| f == t) => {}
            _ => return false,
        }
    }
    if let Some(after) = opts.after_date {
        if note.updated_at < after {
            return false;
        }
    }
    true
}

/// Map a keyword rank (0-based) to a score under the semantic ceiling.
fn keyword_rank_score(rank: usize) -> f64 {
    KEYWORD_SCORE_CEILING / (1.0 + rank as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_scores_decay_below_ceiling() {
        assert!(keyword_rank_score(0) < 0.7);
        assert!(keyword_rank_score(0) > keyword_rank_score(1));
        assert!(keyword_rank_score(1) > keyword_rank_score(5));
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(SearchMode::parse("hybrid"), Some(SearchMode::Hybrid));
        assert_eq!(SearchMode::parse("auto"), Some(SearchMode::Auto));
        assert_eq!(SearchMode::parse("nope"), None);
    }

    #[test]
    fn defaults_match_contract() {
        let opts = SearchOptions::new("main");
        assert_eq!(opts.limit, 10);
        assert_eq!(opts.threshold, 0.7);
        assert_eq!(opts.depth, 0);
        assert!(!opts.full_content);
    }
}
