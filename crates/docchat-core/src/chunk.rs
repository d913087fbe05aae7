//! Paragraph-boundary text chunker.
//!
//! Splits a [`Document`] body into [`Chunk`]s no larger than `max_tokens`.
//! Paragraphs (`\n\n`-separated) are packed greedily; a paragraph that is
//! larger than the budget on its own is hard-split at the last newline or
//! space before the limit.
//!
//! Chunk ids are UUIDv5 values derived from the document id and the chunk
//! index, so chunking the same corpus twice yields the same ids.
//!
//! # Example
//!
//! ```rust
//! use docchat_core::chunk::chunk_document;
//! use docchat_core::models::Document;
//!
//! let doc = Document::new("a.md", "text/markdown", "Hello world.\n\nSecond paragraph.");
//! let chunks = chunk_document(&doc, 256);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].chunk_index, 0);
//! ```

use uuid::Uuid;

use crate::models::{sha256_hex, Chunk, Document};

/// Approximate characters-per-token ratio used for all budget arithmetic.
pub const CHARS_PER_TOKEN: usize = 4;

/// Rough token count of `text` (rounded up).
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Split a document into chunks of at most `max_tokens` (≈ `max_tokens × 4` bytes).
///
/// Blank documents produce no chunks. Indices are contiguous from 0.
pub fn chunk_document(doc: &Document, max_tokens: usize) -> Vec<Chunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;

    let mut pieces: Vec<String> = Vec::new();
    let mut buf = String::new();

    for para in doc.body.split("\n\n").map(str::trim) {
        if para.is_empty() {
            continue;
        }

        let needed = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };
        if needed > max_chars && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
        }

        if para.len() > max_chars {
            pieces.extend(hard_split(para, max_chars));
            continue;
        }

        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
    }

    if !buf.is_empty() {
        pieces.push(buf);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(i, text)| make_chunk(doc, i as i64, text))
        .collect()
}

/// Split an oversized paragraph at whitespace, never inside a UTF-8 sequence.
fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let mut cut = snap_to_char_boundary(rest, max_chars);
        if cut < rest.len() {
            if let Some(pos) = rest[..cut].rfind(['\n', ' ']) {
                if pos > 0 {
                    cut = pos + 1;
                }
            }
        }
        if cut == 0 {
            cut = rest
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
        }

        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        rest = &rest[cut..];
    }

    out
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn make_chunk(doc: &Document, index: i64, text: String) -> Chunk {
    let name = format!("{}#{}", doc.id, index);
    Chunk {
        id: Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string(),
        document_id: doc.id.clone(),
        source: doc.source.clone(),
        chunk_index: index,
        hash: sha256_hex(text.as_bytes()),
        text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(body: &str) -> Document {
        Document::new("doc.md", "text/markdown", body)
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_document(&doc("Hello, world!"), 256);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].source, "doc.md");
    }

    #[test]
    fn test_blank_text_has_no_chunks() {
        assert!(chunk_document(&doc(""), 256).is_empty());
        assert!(chunk_document(&doc("  \n\n \n\n"), 256).is_empty());
    }

    #[test]
    fn test_paragraphs_packed_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk_document(&doc(text), 256);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn test_paragraphs_split_over_limit() {
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let chunks = chunk_document(&doc(text), 6);
        assert_eq!(chunks.len(), 3);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
        assert_eq!(chunks[1].text, "This is paragraph two.");
    }

    #[test]
    fn test_oversized_paragraph_hard_split_on_spaces() {
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        let chunks = chunk_document(&doc(text), 3);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.len() <= 12, "chunk too long: {:?}", c.text);
            assert!(!c.text.starts_with(' ') && !c.text.ends_with(' '));
        }
        let rejoined: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rejoined.join(" "), text);
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let chunks = chunk_document(&doc(text), 3);
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(!c.text.is_empty());
        }
    }

    #[test]
    fn test_ids_deterministic_and_unique() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let c1 = chunk_document(&doc(text), 1);
        let c2 = chunk_document(&doc(text), 1);
        assert_eq!(c1, c2);

        let mut ids: Vec<&str> = c1.iter().map(|c| c.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), c1.len());
    }

    #[test]
    fn test_ids_differ_across_documents() {
        let a = chunk_document(&Document::new("a.md", "text/plain", "same"), 256);
        let b = chunk_document(&Document::new("b.md", "text/plain", "same"), 256);
        assert_ne!(a[0].id, b[0].id);
        assert_eq!(a[0].hash, b[0].hash);
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
