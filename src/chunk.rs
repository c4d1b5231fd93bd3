//! Overlapping whitespace-boundary text chunker.
//!
//! Splits note body text into [`NoteChunk`]s of roughly
//! [`TARGET_CHUNK_CHARS`] characters with a 15% overlap between
//! consecutive chunks. Splitting only ever occurs on whitespace so no
//! word is cut in half.
//!
//! Chunking must be byte-for-byte deterministic: staleness detection
//! compares stored checksums against recomputed ones, so the same input
//! must always yield the same `(text, checksum)` sequence.

use sha2::{Digest, Sha256};

/// Target chunk size in characters.
pub const TARGET_CHUNK_CHARS: usize = 2000;

/// Overlap between consecutive chunks (15% of the target).
pub const OVERLAP_CHARS: usize = TARGET_CHUNK_CHARS * 15 / 100;

/// A bounded slice of a note's body, the atomic unit of embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteChunk {
    /// Dense index from 0 within the note.
    pub ix: i64,
    pub text: String,
}

/// Split text into overlapping chunks. Empty or whitespace-only input
/// produces zero chunks; indices are contiguous starting at 0.
pub fn chunk_text(text: &str) -> Vec<NoteChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let mut chunks: Vec<NoteChunk> = Vec::new();
    let mut start = 0usize;

    loop {
        let remaining = chars.len() - start;
        if remaining <= TARGET_CHUNK_CHARS {
            push_chunk(&mut chunks, &chars[start..]);
            break;
        }

        // Walk back from the target boundary to the nearest whitespace.
        let mut end = start + TARGET_CHUNK_CHARS;
        while end > start && !chars[end].is_whitespace() {
            end -= 1;
        }
        if end == start {
            // No whitespace in the whole window: hard split.
            end = start + TARGET_CHUNK_CHARS;
        }

        push_chunk(&mut chunks, &chars[start..end]);

        // Overlap with the previous chunk, never moving backwards.
        let next = end.saturating_sub(OVERLAP_CHARS);
        start = if next > start { next } else { end };
    }

    chunks
}

fn push_chunk(chunks: &mut Vec<NoteChunk>, piece: &[char]) {
    let text: String = piece.iter().collect();
    if text.trim().is_empty() {
        return;
    }
    chunks.push(NoteChunk {
        ix: chunks.len() as i64,
        text,
    });
}

/// Checksum of a chunk as it is sent to the model: the text prefixed
/// with its task prefix, hashed with SHA-256 and hex-encoded.
pub fn chunk_checksum(task_prefix: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_prefix.as_bytes());
    hasher.update(b": ");
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_text("").is_empty());
        assert!(chunk_text("   \n\t  ").is_empty());
    }

    #[test]
    fn short_input_single_chunk() {
        let chunks = chunk_text("alpha beta");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].ix, 0);
        assert_eq!(chunks[0].text, "alpha beta");
    }

    #[test]
    fn long_input_splits_within_target() {
        let text = (0..1200)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text(&text);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.chars().count() <= TARGET_CHUNK_CHARS);
        }
    }

    #[test]
    fn indices_dense_from_zero() {
        let text = "lorem ipsum ".repeat(1000);
        let chunks = chunk_text(&text);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ix, i as i64);
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = "alpha beta gamma ".repeat(500);
        let chunks = chunk_text(&text);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let prev_tail: String = {
                let t: Vec<char> = pair[0].text.chars().collect();
                t[t.len().saturating_sub(OVERLAP_CHARS / 2)..].iter().collect()
            };
            assert!(
                pair[1].text.contains(prev_tail.trim()),
                "chunk {} does not overlap its predecessor",
                pair[1].ix
            );
        }
    }

    #[test]
    fn no_whitespace_hard_split() {
        let text = "x".repeat(TARGET_CHUNK_CHARS * 2 + 10);
        let chunks = chunk_text(&text);
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].text.chars().count(), TARGET_CHUNK_CHARS);
    }

    #[test]
    fn deterministic_across_runs() {
        let text = "The quick brown fox. ".repeat(400);
        let a = chunk_text(&text);
        let b = chunk_text(&text);
        assert_eq!(a, b);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(
                chunk_checksum("search_document", &x.text),
                chunk_checksum("search_document", &y.text)
            );
        }
    }

    #[test]
    fn checksum_includes_prefix() {
        let doc = chunk_checksum("search_document", "alpha beta");
        let query = chunk_checksum("search_query", "alpha beta");
        assert_ne!(doc, query);
    }

    #[test]
    fn multibyte_input_is_safe() {
        let text = "héllo wörld ☃ ".repeat(300);
        let chunks = chunk_text(&text);
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(text.contains(c.text.trim()));
        }
    }
}
