//! On-disk vector index over SQLite.
//!
//! Stores one embedding row per `(note_id, chunk_ix)` and answers
//! nearest-neighbour queries by exact cosine similarity over the
//! project's rows, which holds up on a single node to around a million
//! vectors.
//!
//! Writes are serialized per `note_id` through an async lock registry;
//! an upsert runs in one transaction so a note is never observable with
//! mixed old/new chunks. Reads never block on writers of other notes.

use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::VectorIndexError;

/// A chunk vector ready for insertion.
#[derive(Debug, Clone)]
pub struct ChunkVector {
    pub ix: i64,
    pub vector: Vec<f32>,
    pub checksum: String,
}

/// One ANN hit, collapsed to the best-scoring chunk of a note.
#[derive(Debug, Clone)]
pub struct AnnHit {
    pub note_id: String,
    pub best_chunk_ix: i64,
    pub score: f64,
}

pub struct VectorIndex {
    pool: SqlitePool,
    note_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VectorIndex {
    /// Open (creating if needed) the index at `path` and run migrations.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let pool = crate::db::connect(path).await?;
        crate::migrate::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            note_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn lock_for(&self, note_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.note_locks.lock().await;
        // Idle entries are held only by the map; evict them so the
        // registry tracks in-flight notes, not every note ever touched.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(note_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Atomically replace a note's rows: rows with `chunk_ix >= N` are
    /// deleted and the N new rows written, all in one transaction.
    pub async fn upsert_chunks(
        &self,
        note_id: &str,
        project: &str,
        model: &str,
        task_prefix: &str,
        chunks: &[ChunkVector],
    ) -> Result<(), VectorIndexError> {
        let dims = match chunks.first() {
            Some(c) => c.vector.len(),
            None => return self.delete_note(note_id).await,
        };
        for c in chunks {
            if c.vector.len() != dims {
                return Err(VectorIndexError::Corrupt(format!(
                    "ragged vectors for note {note_id}: {} vs {dims}",
                    c.vector.len()
                )));
            }
        }
        self.check_dims(dims).await?;

        let lock = self.lock_for(note_id).await;
        let _guard = lock.lock().await;

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM embeddings WHERE note_id = ? AND chunk_ix >= ?")
            .bind(note_id)
            .bind(chunks.len() as i64)
            .execute(&mut *tx)
            .await?;

        for c in chunks {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO embeddings
                    (note_id, chunk_ix, project, embedding, model, dims,
                     task_prefix, content_checksum, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(note_id)
            .bind(c.ix)
            .bind(project)
            .bind(vec_to_blob(&c.vector))
            .bind(model)
            .bind(dims as i64)
            .bind(task_prefix)
            .bind(&c.checksum)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_note(&self, note_id: &str) -> Result<(), VectorIndexError> {
        let lock = self.lock_for(note_id).await;
        let _guard = lock.lock().await;
        sqlx::query("DELETE FROM embeddings WHERE note_id = ?")
            .bind(note_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Cosine search over a project's rows, collapsed to the best chunk
    /// per note, filtered by `threshold` and sorted descending.
    pub async fn search_ann(
        &self,
        query: &[f32],
        project: &str,
        k: usize,
        threshold: f64,
    ) -> Result<Vec<AnnHit>, VectorIndexError> {
        let rows = sqlx::query(
            "SELECT note_id, chunk_ix, embedding, dims FROM embeddings WHERE project = ?",
        )
        .bind(project)
        .fetch_all(&self.pool)
        .await?;

        let mut best: HashMap<String, AnnHit> = HashMap::new();
        for row in &rows {
            let dims: i64 = row.get("dims");
            if dims as usize != query.len() {
                return Err(VectorIndexError::DimensionMismatch {
                    stored: dims as usize,
                    model: query.len(),
                });
            }
            let blob: Vec<u8> = row.get("embedding");
            let vector = blob_to_vec(&blob);
            let score = cosine_similarity(query, &vector) as f64;
            let note_id: String = row.get("note_id");
            let chunk_ix: i64 = row.get("chunk_ix");

            match best.get_mut(&note_id) {
                Some(hit) if hit.score >= score => {}
                Some(hit) => {
                    hit.score = score;
                    hit.best_chunk_ix = chunk_ix;
                }
                None => {
                    best.insert(
                        note_id.clone(),
                        AnnHit {
                            note_id,
                            best_chunk_ix: chunk_ix,
                            score,
                        },
                    );
                }
            }
        }

        let mut hits: Vec<AnnHit> = best.into_values().filter(|h| h.score >= threshold).collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.note_id.cmp(&b.note_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Number of vectors stored for a project. Zero means semantic
    /// search has nothing to work with (auto mode falls back to keyword).
    pub async fn count_vectors(&self, project: &str) -> Result<i64, VectorIndexError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE project = ?")
            .bind(project)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Stored checksums for a note keyed by chunk index.
    pub async fn stored_checksums(
        &self,
        note_id: &str,
    ) -> Result<HashMap<i64, String>, VectorIndexError> {
        let rows =
            sqlx::query("SELECT chunk_ix, content_checksum FROM embeddings WHERE note_id = ?")
                .bind(note_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<i64, _>("chunk_ix"), r.get::<String, _>("content_checksum")))
            .collect())
    }

    /// Candidates (enumerated from the upstream store) with no rows.
    pub async fn list_missing(
        &self,
        project: &str,
        candidates: &[String],
    ) -> Result<Vec<String>, VectorIndexError> {
        let rows = sqlx::query("SELECT DISTINCT note_id FROM embeddings WHERE project = ?")
            .bind(project)
            .fetch_all(&self.pool)
            .await?;
        let present: HashSet<String> = rows.iter().map(|r| r.get("note_id")).collect();
        Ok(candidates
            .iter()
            .filter(|c| !present.contains(*c))
            .cloned()
            .collect())
    }

    /// Candidates whose stored checksums differ from the recomputed set
    /// (per-chunk mismatch or a different chunk count).
    pub async fn list_stale(
        &self,
        project: &str,
        recomputed: &[(String, Vec<(i64, String)>)],
    ) -> Result<Vec<String>, VectorIndexError> {
        let rows = sqlx::query(
            "SELECT note_id, chunk_ix, content_checksum FROM embeddings WHERE project = ?",
        )
        .bind(project)
        .fetch_all(&self.pool)
        .await?;

        let mut stored: HashMap<String, HashMap<i64, String>> = HashMap::new();
        for row in &rows {
            stored
                .entry(row.get("note_id"))
                .or_default()
                .insert(row.get("chunk_ix"), row.get("content_checksum"));
        }

        let mut stale = Vec::new();
        for (note_id, chunks) in recomputed {
            let Some(have) = stored.get(note_id) else {
                // Missing, not stale.
                continue;
            };
            let mismatch = have.len() != chunks.len()
                || chunks
                    .iter()
                    .any(|(ix, sum)| have.get(ix).map(|s| s != sum).unwrap_or(true));
            if mismatch {
                stale.push(note_id.clone());
            }
        }
        Ok(stale)
    }
}

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; 0.0 for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

impl VectorIndex {
    async fn check_dims(&self, dims: usize) -> Result<(), VectorIndexError> {
        let stored: Option<i64> = sqlx::query_scalar("SELECT dims FROM embeddings LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        match stored {
            Some(d) if d as usize != dims => Err(VectorIndexError::DimensionMismatch {
                stored: d as usize,
                model: dims,
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cv(ix: i64, v: &[f32], checksum: &str) -> ChunkVector {
        ChunkVector {
            ix,
            vector: v.to_vec(),
            checksum: checksum.to_string(),
        }
    }

    async fn open_index() -> (TempDir, VectorIndex) {
        let tmp = TempDir::new().unwrap();
        let index = VectorIndex::open(&tmp.path().join("index.sqlite"))
            .await
            .unwrap();
        (tmp, index)
    }

    #[test]
    fn blob_roundtrip() {
        let v = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn cosine_basics() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn upsert_then_search() {
        let (_tmp, index) = open_index().await;
        index
            .upsert_chunks(
                "notes/a",
                "main",
                "m",
                "search_document",
                &[cv(0, &[1.0, 0.0], "c0"), cv(1, &[0.9, 0.1], "c1")],
            )
            .await
            .unwrap();

        let hits = index.search_ann(&[1.0, 0.0], "main", 10, 0.7).await.unwrap();
        assert_eq!(hits.len(), 1, "per-note duplicates must collapse");
        assert_eq!(hits[0].note_id, "notes/a");
        assert_eq!(hits[0].best_chunk_ix, 0);
        assert!(hits[0].score > 0.99);
    }

    #[tokio::test]
    async fn threshold_filters_hits() {
        let (_tmp, index) = open_index().await;
        index
            .upsert_chunks("notes/a", "main", "m", "search_document", &[cv(0, &[0.0, 1.0], "c")])
            .await
            .unwrap();
        let hits = index.search_ann(&[1.0, 0.0], "main", 10, 0.7).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn shrinking_note_drops_tail_chunks() {
        let (_tmp, index) = open_index().await;
        index
            .upsert_chunks(
                "notes/a",
                "main",
                "m",
                "search_document",
                &[cv(0, &[1.0, 0.0], "a0"), cv(1, &[1.0, 0.0], "a1")],
            )
            .await
            .unwrap();
        index
            .upsert_chunks("notes/a", "main", "m", "search_document", &[cv(0, &[1.0, 0.0], "b0")])
            .await
            .unwrap();

        let sums = index.stored_checksums("notes/a").await.unwrap();
        assert_eq!(sums.len(), 1);
        assert_eq!(sums.get(&0).unwrap(), "b0");
    }

    #[tokio::test]
    async fn empty_upsert_deletes_note() {
        let (_tmp, index) = open_index().await;
        index
            .upsert_chunks("notes/a", "main", "m", "search_document", &[cv(0, &[1.0], "c")])
            .await
            .unwrap();
        index
            .upsert_chunks("notes/a", "main", "m", "search_document", &[])
            .await
            .unwrap();
        assert_eq!(index.count_vectors("main").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_surfaced() {
        let (_tmp, index) = open_index().await;
        index
            .upsert_chunks("notes/a", "main", "m", "search_document", &[cv(0, &[1.0, 0.0], "c")])
            .await
            .unwrap();

        let err = index
            .upsert_chunks("notes/b", "main", "m", "search_document", &[cv(0, &[1.0, 0.0, 0.0], "c")])
            .await
            .unwrap_err();
        assert!(matches!(err, VectorIndexError::DimensionMismatch { .. }));

        let err = index.search_ann(&[1.0], "main", 5, 0.0).await.unwrap_err();
        assert!(matches!(err, VectorIndexError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn missing_and_stale_partition() {
        let (_tmp, index) = open_index().await;
        index
            .upsert_chunks("notes/a", "main", "m", "search_document", &[cv(0, &[1.0], "same")])
            .await
            .unwrap();

        let candidates = vec!["notes/a".to_string(), "notes/b".to_string()];
        let missing = index.list_missing("main", &candidates).await.unwrap();
        assert_eq!(missing, vec!["notes/b"]);

        let recomputed = vec![
            ("notes/a".to_string(), vec![(0i64, "same".to_string())]),
            ("notes/b".to_string(), vec![(0i64, "x".to_string())]),
        ];
        let stale = index.list_stale("main", &recomputed).await.unwrap();
        assert!(stale.is_empty());

        let recomputed = vec![("notes/a".to_string(), vec![(0i64, "changed".to_string())])];
        let stale = index.list_stale("main", &recomputed).await.unwrap();
        assert_eq!(stale, vec!["notes/a"]);
    }

    #[tokio::test]
    async fn note_lock_registry_stays_bounded() {
        let (_tmp, index) = open_index().await;
        for i in 0..25 {
            index.delete_note(&format!("notes/n{i}")).await.unwrap();
        }
        // Idle locks are evicted as new ones are taken; only the entry
        // from the last operation may remain.
        assert!(index.note_locks.lock().await.len() <= 1);
    }
}
