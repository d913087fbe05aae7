//! Top-k retrieval by cosine similarity.
//!
//! Brute-force scoring over every entry of an [`Index`](crate::index::Index):
//!
//! 1. Score each entry against the query vector.
//! 2. Drop entries scoring NaN, and those below `min_score` if one is set.
//! 3. Sort by score (desc), then by insertion position (asc).
//! 4. Truncate to `k`.
//!
//! The positional tie-break makes the ranking a pure function of the index
//! contents and the query vector.

use crate::embedding::cosine_similarity;
use crate::index::IndexEntry;
use crate::models::ScoredChunk;

/// Retrieval tuning parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrieveParams {
    /// Maximum number of chunks to return.
    pub top_k: usize,
    /// Candidates scoring below this are discarded.
    pub min_score: Option<f32>,
}

impl RetrieveParams {
    pub fn top_k(top_k: usize) -> Self {
        Self {
            top_k,
            min_score: None,
        }
    }
}

/// Return at most `params.top_k` entries, most similar first.
pub fn retrieve(entries: &[IndexEntry], query_vec: &[f32], params: RetrieveParams) -> Vec<ScoredChunk> {
    if params.top_k == 0 || entries.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(usize, f32)> = entries
        .iter()
        .enumerate()
        .map(|(pos, entry)| (pos, cosine_similarity(query_vec, &entry.embedding)))
        // NaN (an overflowed norm) has no rank.
        .filter(|(_, score)| !score.is_nan())
        .filter(|(_, score)| params.min_score.map_or(true, |min| *score >= min))
        .collect();

    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    scored.truncate(params.top_k);

    scored
        .into_iter()
        .map(|(pos, score)| ScoredChunk {
            chunk: entries[pos].chunk.clone(),
            score,
        })
        .collect()
}
