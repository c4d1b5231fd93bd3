//! Vector index schema migration. Idempotent.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per (note, chunk); replaced wholesale when a note changes.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            note_id TEXT NOT NULL,
            chunk_ix INTEGER NOT NULL,
            project TEXT NOT NULL,
            embedding BLOB NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            task_prefix TEXT NOT NULL,
            content_checksum TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (note_id, chunk_ix)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_embeddings_project ON embeddings(project)")
        .execute(pool)
        .await?;

    Ok(())
}
