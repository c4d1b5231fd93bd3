//! Embedding pipeline: note → chunks → batched model calls → index.
//!
//! Orchestrates embedding with bounded concurrency (default 4 in-flight
//! notes, `EMBEDDING_CONCURRENCY` to override), per-note sub-batches of
//! at most [`MODEL_BATCH_CHUNKS`] chunks, and settle-all error
//! aggregation: one note's failure never blocks or fails its siblings.
//! Catch-up reconciles the index against the upstream store and returns
//! almost instantly when nothing is missing or stale.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::chunk::{chunk_checksum, chunk_text};
use crate::error::{ModelError, VectorIndexError};
use crate::index::{ChunkVector, VectorIndex};
use crate::model_client::{Embedder, TASK_PREFIX_DOCUMENT};
use crate::store::NoteStore;
use serde::Serialize;

/// Upper bound on chunks per model request, to bound request memory.
pub const MODEL_BATCH_CHUNKS: usize = 32;

const DEFAULT_CONCURRENCY: usize = 4;

/// What happened to a single note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedOutcome {
    /// New rows were written.
    Embedded,
    /// Checksums matched; nothing to do.
    Skipped,
    /// The note was confirmed absent or empty; its rows were removed.
    Deleted,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Index(#[from] VectorIndexError),

    #[error("note store error: {0}")]
    Store(String),

    #[error("embedding pipeline is shutting down")]
    Shutdown,
}

/// One failed note in a batch report.
#[derive(Debug, Clone, Serialize)]
pub struct EmbedFailure {
    pub note_id: String,
    pub error: String,
}

/// Settle-all result of a batch or catch-up run. A failed note appears
/// in `failed` and is picked up by the next catch-up.
#[derive(Debug, Default, Serialize)]
pub struct EmbedReport {
    pub embedded: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub failed: Vec<EmbedFailure>,
    /// Set when a dimension mismatch halted the batch. Model drift is a
    /// config problem, not a data problem; operator action is required.
    pub halted: Option<String>,
}

pub struct EmbeddingPipeline {
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    store: Arc<dyn NoteStore>,
    limiter: Arc<Semaphore>,
}

/// Concurrency bound from `EMBEDDING_CONCURRENCY`, clamped to 1..=16.
pub fn concurrency_limit() -> usize {
    std::env::var("EMBEDDING_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .map(|n| n.clamp(1, 16))
        .unwrap_or(DEFAULT_CONCURRENCY)
}

impl EmbeddingPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorIndex>,
        store: Arc<dyn NoteStore>,
    ) -> Self {
        Self {
            embedder,
            index,
            store,
            limiter: Arc::new(Semaphore::new(concurrency_limit())),
        }
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    pub fn dims(&self) -> usize {
        self.embedder.dims()
    }

    /// Fire-and-forget embed, invoked on note create/edit. Failures are
    /// logged, never propagated; the next catch-up covers them.
    pub fn embed_note(self: &Arc<Self>, project: &str, note_id: &str) {
        let pipeline = Arc::clone(self);
        let project = project.to_string();
        let note_id = note_id.to_string();
        tokio::spawn(async move {
            match pipeline.embed_note_now(&project, &note_id).await {
                Ok(outcome) => {
                    tracing::debug!(note = %note_id, ?outcome, "embed complete");
                }
                Err(e) => {
                    tracing::warn!(note = %note_id, error = %e, "embed failed; deferred to catch-up");
                }
            }
        });
    }

    /// Embed one note now. Idempotent: unchanged content is skipped.
    pub async fn embed_note_now(
        &self,
        project: &str,
        note_id: &str,
    ) -> Result<EmbedOutcome, PipelineError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| PipelineError::Shutdown)?;

        // Rows are dropped only on confirmed absence; a store outage must
        // surface as a failure, not masquerade as a deletion.
        let note = match self.store.resolve(project, note_id).await {
            Ok(Some(note)) => note,
            Ok(None) => {
                self.index.delete_note(note_id).await?;
                return Ok(EmbedOutcome::Deleted);
            }
            Err(e) => return Err(PipelineError::Store(e.to_string())),
        };

        let chunks = chunk_text(&note.body);
        if chunks.is_empty() {
            self.index.delete_note(note_id).await?;
            return Ok(EmbedOutcome::Deleted);
        }

        let checksums: Vec<String> = chunks
            .iter()
            .map(|c| chunk_checksum(TASK_PREFIX_DOCUMENT, &c.text))
            .collect();

        let stored = self.index.stored_checksums(note_id).await?;
        if stored.len() == chunks.len()
            && chunks
                .iter()
                .zip(&checksums)
                .all(|(c, sum)| stored.get(&c.ix).map(|s| s == sum).unwrap_or(false))
        {
            return Ok(EmbedOutcome::Skipped);
        }

        let mut rows: Vec<ChunkVector> = Vec::with_capacity(chunks.len());
        for sub in chunks.chunks(MODEL_BATCH_CHUNKS) {
            let texts: Vec<String> = sub.iter().map(|c| c.text.clone()).collect();
            let vectors = self
                .embedder
                .embed_batch(&texts, TASK_PREFIX_DOCUMENT)
                .await?;
            for (chunk, vector) in sub.iter().zip(vectors) {
                rows.push(ChunkVector {
                    ix: chunk.ix,
                    vector,
                    checksum: chunk_checksum(TASK_PREFIX_DOCUMENT, &chunk.text),
                });
            }
        }

        self.index
            .upsert_chunks(
                note_id,
                project,
                self.embedder.model_name(),
                TASK_PREFIX_DOCUMENT,
                &rows,
            )
            .await?;

        Ok(EmbedOutcome::Embedded)
    }

    /// Embed many notes with bounded concurrency and settle-all
    /// semantics. A dimension mismatch halts scheduling of further
    /// notes; everything else is isolated per note.
    pub async fn embed_batch(
        self: &Arc<Self>,
        project: &str,
        note_ids: &[String],
        limit: Option<usize>,
    ) -> EmbedReport {
        let mut ids: Vec<String> = note_ids.to_vec();
        if let Some(limit) = limit {
            ids.truncate(limit);
        }

        let halt = Arc::new(AtomicBool::new(false));
        let mut set: JoinSet<(String, Result<EmbedOutcome, PipelineError>)> = JoinSet::new();

        for note_id in ids {
            let pipeline = Arc::clone(self);
            let project = project.to_string();
            let halt = Arc::clone(&halt);
            set.spawn(async move {
                if halt.load(Ordering::SeqCst) {
                    return (
                        note_id,
                        Err(PipelineError::Store("batch halted".to_string())),
                    );
                }
                let result = pipeline.embed_note_now(&project, &note_id).await;
                if matches!(
                    result,
                    Err(PipelineError::Index(VectorIndexError::DimensionMismatch { .. }))
                ) {
                    halt.store(true, Ordering::SeqCst);
                }
                (note_id, result)
            });
        }

        let mut report = EmbedReport::default();
        while let Some(joined) = set.join_next().await {
            let Ok((note_id, result)) = joined else {
                continue;
            };
            match result {
                Ok(EmbedOutcome::Embedded) => report.embedded += 1,
                Ok(EmbedOutcome::Skipped) => report.skipped += 1,
                Ok(EmbedOutcome::Deleted) => report.deleted += 1,
                Err(e) => {
                    if let PipelineError::Index(VectorIndexError::DimensionMismatch {
                        ..
                    }) = &e
                    {
                        report.halted = Some(e.to_string());
                    }
                    report.failed.push(EmbedFailure {
                        note_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Reconcile a project: enumerate upstream notes, embed the missing
    /// and stale ones. Fast path returns immediately when there is no
    /// work; callers may fire-and-forget.
    pub async fn catch_up_project(self: &Arc<Self>, project: &str) -> EmbedReport {
        let note_ids = match self.store.list_directory(project, "").await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(project, error = %e, "catch-up could not list notes");
                return EmbedReport::default();
            }
        };

        let missing = match self.index.list_missing(project, &note_ids).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(project, error = %e, "catch-up index read failed");
                return EmbedReport::default();
            }
        };

        // Recompute checksums only for notes the index already has.
        let mut recomputed: Vec<(String, Vec<(i64, String)>)> = Vec::new();
        for note_id in note_ids.iter().filter(|id| !missing.contains(id)) {
            if let Ok(note) = self.store.read_note(project, note_id).await {
                let sums = chunk_text(&note.body)
                    .iter()
                    .map(|c| (c.ix, chunk_checksum(TASK_PREFIX_DOCUMENT, &c.text)))
                    .collect();
                recomputed.push((note_id.clone(), sums));
            }
        }
        let stale = match self.index.list_stale(project, &recomputed).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(project, error = %e, "catch-up staleness check failed");
                return EmbedReport::default();
            }
        };

        if missing.is_empty() && stale.is_empty() {
            return EmbedReport::default();
        }

        let mut work = missing;
        work.extend(stale);
        tracing::info!(project, notes = work.len(), "catch-up embedding");
        self.embed_batch(project, &work, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_env_is_clamped() {
        // No env set: default.
        std::env::remove_var("EMBEDDING_CONCURRENCY");
        assert_eq!(concurrency_limit(), 4);

        std::env::set_var("EMBEDDING_CONCURRENCY", "99");
        assert_eq!(concurrency_limit(), 16);

        std::env::set_var("EMBEDDING_CONCURRENCY", "0");
        assert_eq!(concurrency_limit(), 1);

        std::env::set_var("EMBEDDING_CONCURRENCY", "garbage");
        assert_eq!(concurrency_limit(), 4);

        std::env::remove_var("EMBEDDING_CONCURRENCY");
    }
}
