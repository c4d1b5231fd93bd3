mod helpers;

use brain::chunk::{chunk_checksum, chunk_text};
use brain::index::VectorIndex;
use brain::model_client::TASK_PREFIX_DOCUMENT;
use brain::pipeline::{EmbedOutcome, EmbeddingPipeline};
use brain::store::{EditOp, NoteStore};
use helpers::{MemoryStore, ScriptedEmbedder};
use std::sync::Arc;
use tempfile::TempDir;

struct Stack {
    _dir: TempDir,
    store: Arc<MemoryStore>,
    embedder: Arc<ScriptedEmbedder>,
    index: Arc<VectorIndex>,
    pipeline: Arc<EmbeddingPipeline>,
}

async fn stack(dims: usize) -> Stack {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let embedder = Arc::new(ScriptedEmbedder::new(dims));
    let index = Arc::new(
        VectorIndex::open(&dir.path().join("index.db"))
            .await
            .unwrap(),
    );
    let pipeline = Arc::new(EmbeddingPipeline::new(
        embedder.clone(),
        index.clone(),
        store.clone(),
    ));
    Stack {
        _dir: dir,
        store,
        embedder,
        index,
        pipeline,
    }
}

#[tokio::test]
async fn fresh_note_is_embedded_with_prefixed_checksums() {
    let s = stack(8).await;
    let note = s
        .store
        .write_note("main", "notes", "Alpha", "alpha beta")
        .await
        .unwrap();

    let outcome = s
        .pipeline
        .embed_note_now("main", &note.permalink)
        .await
        .unwrap();
    assert!(matches!(outcome, EmbedOutcome::Embedded));

    let checksums = s.index.stored_checksums(&note.permalink).await.unwrap();
    let chunks = chunk_text("alpha beta");
    assert_eq!(checksums.len(), chunks.len());
    for chunk in &chunks {
        let expected = chunk_checksum(TASK_PREFIX_DOCUMENT, &chunk.text);
        assert_eq!(checksums.get(&chunk.ix), Some(&expected));
    }
    assert_eq!(s.index.count_vectors("main").await.unwrap(), chunks.len() as i64);
}

#[tokio::test]
async fn unchanged_note_skips_the_model() {
    let s = stack(8).await;
    let note = s
        .store
        .write_note("main", "notes", "Stable", "nothing changes here")
        .await
        .unwrap();

    let first = s
        .pipeline
        .embed_note_now("main", &note.permalink)
        .await
        .unwrap();
    assert!(matches!(first, EmbedOutcome::Embedded));
    let calls_after_first = s.embedder.call_count();

    let second = s
        .pipeline
        .embed_note_now("main", &note.permalink)
        .await
        .unwrap();
    assert!(matches!(second, EmbedOutcome::Skipped));
    assert_eq!(s.embedder.call_count(), calls_after_first);
}

#[tokio::test]
async fn edited_note_is_detected_stale_and_reembedded() {
    let s = stack(8).await;
    let note = s
        .store
        .write_note("main", "notes", "Drift", "original text")
        .await
        .unwrap();
    s.pipeline
        .embed_note_now("main", &note.permalink)
        .await
        .unwrap();

    s.store
        .edit_note(
            "main",
            &note.permalink,
            EditOp::FindReplace {
                find: "original".to_string(),
                replace: "revised".to_string(),
            },
        )
        .await
        .unwrap();

    let edited = s.store.read_note("main", &note.permalink).await.unwrap();
    let recomputed: Vec<(String, Vec<(i64, String)>)> = vec![(
        note.permalink.clone(),
        chunk_text(&edited.body)
            .iter()
            .map(|c| (c.ix, chunk_checksum(TASK_PREFIX_DOCUMENT, &c.text)))
            .collect(),
    )];
    let stale = s.index.list_stale("main", &recomputed).await.unwrap();
    assert_eq!(stale, vec![note.permalink.clone()]);

    let outcome = s
        .pipeline
        .embed_note_now("main", &note.permalink)
        .await
        .unwrap();
    assert!(matches!(outcome, EmbedOutcome::Embedded));

    let checksums = s.index.stored_checksums(&note.permalink).await.unwrap();
    let expected: Vec<String> = chunk_text(&edited.body)
        .iter()
        .map(|c| chunk_checksum(TASK_PREFIX_DOCUMENT, &c.text))
        .collect();
    assert_eq!(checksums.len(), expected.len());
    assert!(expected.iter().all(|sum| checksums.values().any(|s| s == sum)));
}

#[tokio::test]
async fn deleted_note_drops_its_rows() {
    let s = stack(8).await;
    let note = s
        .store
        .write_note("main", "notes", "Gone", "soon to vanish")
        .await
        .unwrap();
    s.pipeline
        .embed_note_now("main", &note.permalink)
        .await
        .unwrap();
    assert!(s.index.count_vectors("main").await.unwrap() > 0);

    s.store.delete_note("main", &note.permalink).await.unwrap();
    let outcome = s
        .pipeline
        .embed_note_now("main", &note.permalink)
        .await
        .unwrap();
    assert!(matches!(outcome, EmbedOutcome::Deleted));
    assert_eq!(s.index.count_vectors("main").await.unwrap(), 0);
}

#[tokio::test]
async fn store_outage_is_a_failure_not_a_deletion() {
    let s = stack(8).await;
    let note = s
        .store
        .write_note("main", "notes", "Flaky", "still very much here")
        .await
        .unwrap();
    s.pipeline
        .embed_note_now("main", &note.permalink)
        .await
        .unwrap();
    let rows_before = s.index.count_vectors("main").await.unwrap();
    assert!(rows_before > 0);

    // The note still exists; only the store is unreachable.
    s.store.set_unavailable(true);
    let result = s.pipeline.embed_note_now("main", &note.permalink).await;
    assert!(result.is_err());
    assert_eq!(s.index.count_vectors("main").await.unwrap(), rows_before);

    let report = s
        .pipeline
        .embed_batch("main", &[note.permalink.clone()], None)
        .await;
    assert_eq!(report.deleted, 0);
    assert_eq!(report.failed.len(), 1);

    // Once the store is back the rows are still valid and skipped.
    s.store.set_unavailable(false);
    let outcome = s
        .pipeline
        .embed_note_now("main", &note.permalink)
        .await
        .unwrap();
    assert!(matches!(outcome, EmbedOutcome::Skipped));
}

#[tokio::test]
async fn catch_up_embeds_only_missing_and_stale_notes() {
    let s = stack(8).await;
    let kept = s
        .store
        .write_note("main", "notes", "Kept", "already indexed")
        .await
        .unwrap();
    s.pipeline
        .embed_note_now("main", &kept.permalink)
        .await
        .unwrap();

    s.store
        .write_note("main", "notes", "Fresh", "never indexed")
        .await
        .unwrap();

    let calls_before = s.embedder.call_count();
    let report = s.pipeline.catch_up_project("main").await;
    assert_eq!(report.embedded, 1);
    assert!(report.failed.is_empty());
    // Fast path: the already-indexed note never reaches the model.
    assert_eq!(s.embedder.call_count(), calls_before + 1);
}

#[tokio::test]
async fn model_failure_is_isolated_per_note() {
    let s = stack(8).await;
    s.store
        .write_note("main", "notes", "Doomed", "will not embed")
        .await
        .unwrap();
    s.embedder.set_fail(true);

    let report = s.pipeline.catch_up_project("main").await;
    assert_eq!(report.embedded, 0);
    assert_eq!(report.failed.len(), 1);

    // Recovery on the next pass.
    s.embedder.set_fail(false);
    let report = s.pipeline.catch_up_project("main").await;
    assert_eq!(report.embedded, 1);
    assert!(report.failed.is_empty());
}
