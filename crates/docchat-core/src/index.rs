//! The in-memory retrieval index.
//!
//! An [`Index`] owns every (chunk, embedding) pair of a corpus together with
//! the [`IndexMeta`] needed to decide whether a persisted copy is still
//! usable. It is built once, then shared read-only.
//!
//! # Invariants
//!
//! Checked by every constructor:
//!
//! - every chunk has exactly one embedding;
//! - chunk ids are unique;
//! - every embedding has `meta.dims` components;
//! - every chunk belongs to one of the index's documents.

use std::collections::HashSet;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{sha256_hex, Chunk, Document, ScoredChunk};
use crate::retrieve::{retrieve, RetrieveParams};

/// Current on-disk format version.
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Metadata describing how an index was built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub version: u32,
    /// Embedding model that produced the vectors.
    pub embedding_model: String,
    pub dims: usize,
    /// See [`corpus_fingerprint`].
    pub corpus_fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// A chunk with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct Index {
    meta: IndexMeta,
    documents: Vec<Document>,
    entries: Vec<IndexEntry>,
}

impl Index {
    /// Assemble an index, validating its invariants.
    pub fn new(meta: IndexMeta, documents: Vec<Document>, entries: Vec<IndexEntry>) -> Result<Self> {
        let doc_ids: HashSet<&str> = documents.iter().map(|d| d.id.as_str()).collect();
        let mut chunk_ids: HashSet<&str> = HashSet::with_capacity(entries.len());

        for entry in &entries {
            if !chunk_ids.insert(entry.chunk.id.as_str()) {
                bail!("duplicate chunk id {}", entry.chunk.id);
            }
            if entry.embedding.len() != meta.dims {
                bail!(
                    "chunk {} has a {}-dimensional embedding, expected {}",
                    entry.chunk.id,
                    entry.embedding.len(),
                    meta.dims
                );
            }
            if !doc_ids.contains(entry.chunk.document_id.as_str()) {
                bail!(
                    "chunk {} references unknown document {}",
                    entry.chunk.id,
                    entry.chunk.document_id
                );
            }
        }

        Ok(Self {
            meta,
            documents,
            entries,
        })
    }

    /// Assemble an index from parallel chunk and embedding lists.
    pub fn from_parts(
        meta: IndexMeta,
        documents: Vec<Document>,
        chunks: Vec<Chunk>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<Self> {
        if chunks.len() != embeddings.len() {
            bail!(
                "{} chunks but {} embeddings",
                chunks.len(),
                embeddings.len()
            );
        }
        let entries = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| IndexEntry { chunk, embedding })
            .collect();
        Self::new(meta, documents, entries)
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.entries.iter().map(|e| &e.chunk)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top-k chunks for an already-embedded query.
    pub fn retrieve(&self, query_vec: &[f32], params: RetrieveParams) -> Vec<ScoredChunk> {
        retrieve(&self.entries, query_vec, params)
    }
}

/// Fingerprint of a corpus version: SHA-256 over every document's source
/// and body, in the order given.
pub fn corpus_fingerprint(documents: &[Document]) -> String {
    let mut material = Vec::new();
    for doc in documents {
        material.extend_from_slice(doc.source.as_bytes());
        material.push(0);
        material.extend_from_slice(doc.body.as_bytes());
        material.push(0);
    }
    sha256_hex(&material)
}
