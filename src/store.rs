//! Index persistence: load a snapshot, or build and persist one.
//!
//! A snapshot is three JSON files in `storage.dir`:
//!
//! | File | Contents |
//! |------|----------|
//! | `docstore.json` | format version, documents, chunks in insertion order |
//! | `vector_store.json` | chunk id → base64 of little-endian `f32` bytes |
//! | `index_store.json` | [`IndexMeta`] plus the SHA-256 of the two files above |
//!
//! `docstore.json` is the primary file: it is deleted before a new snapshot
//! is written and published last, so its presence means "a complete write
//! happened". Every file is written to a temporary file in the same
//! directory and renamed into place.
//!
//! Loading is all-or-nothing. Any [`SnapshotError`] (missing file, bad
//! checksum, wrong version, different embedding model, broken invariant)
//! discards the snapshot and [`load_or_build`] rebuilds from the corpus.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{info, warn};

use docchat_core::chunk::chunk_document;
use docchat_core::embedding::{blob_to_vec, vec_to_blob, Embedder};
use docchat_core::index::{corpus_fingerprint, Index, IndexMeta, INDEX_FORMAT_VERSION};
use docchat_core::models::{sha256_hex, Chunk, Document};

use crate::config::Config;
use crate::corpus::load_documents;

pub const DOCSTORE_FILE: &str = "docstore.json";
pub const VECTOR_STORE_FILE: &str = "vector_store.json";
pub const INDEX_STORE_FILE: &str = "index_store.json";

/// Why a snapshot could not be used.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("no snapshot in {}", .0.display())]
    Missing(PathBuf),

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {file}: {message}")]
    Malformed { file: &'static str, message: String },

    #[error("checksum mismatch for {0}")]
    Checksum(&'static str),

    #[error("unsupported snapshot version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("snapshot built with embedding model '{found}', configured model is '{expected}'")]
    ModelMismatch { found: String, expected: String },

    #[error("corpus changed since the snapshot was built")]
    Stale,

    #[error("snapshot violates index invariants: {0}")]
    Invalid(String),
}

#[derive(Serialize, Deserialize)]
struct DocStoreFile {
    version: u32,
    documents: Vec<Document>,
    chunks: Vec<Chunk>,
}

#[derive(Serialize, Deserialize)]
struct VectorStoreFile {
    vectors: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct IndexStoreFile {
    meta: IndexMeta,
    docstore_sha256: String,
    vector_store_sha256: String,
}

/// Summary of the snapshot on disk, for `docchat index status`.
#[derive(Debug, Clone)]
pub struct SnapshotStatus {
    pub meta: IndexMeta,
    pub documents: usize,
    pub chunks: usize,
}

/// Load the persisted index, rebuilding it when the snapshot is missing or
/// unusable.
///
/// Creates `storage.dir` and `corpus.dir` if absent. A snapshot problem is
/// never an error here; only a failed rebuild (empty corpus, embedding
/// failure, unwritable storage) is.
pub async fn load_or_build(config: &Config, embedder: &dyn Embedder) -> Result<Index> {
    let dir = &config.storage.dir;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create storage dir {}", dir.display()))?;
    std::fs::create_dir_all(&config.corpus.dir)
        .with_context(|| format!("Failed to create corpus dir {}", config.corpus.dir.display()))?;

    match load_snapshot(dir, embedder.model_name()) {
        Ok(index) => {
            if !config.index.verify_corpus {
                info!(chunks = index.len(), "loaded index snapshot");
                return Ok(index);
            }
            let documents = load_documents(&config.corpus)?;
            if corpus_fingerprint(&documents) == index.meta().corpus_fingerprint {
                info!(chunks = index.len(), "loaded index snapshot (corpus verified)");
                return Ok(index);
            }
            warn!(error = %SnapshotError::Stale, "discarding snapshot, rebuilding");
            build_and_persist(config, documents, embedder).await
        }
        Err(SnapshotError::Missing(_)) => {
            info!(dir = %dir.display(), "no index snapshot, building");
            build(config, embedder).await
        }
        Err(e) => {
            warn!(error = %e, "discarding unusable snapshot, rebuilding");
            build(config, embedder).await
        }
    }
}

/// Build the index from the corpus and persist it, replacing any snapshot.
pub async fn build(config: &Config, embedder: &dyn Embedder) -> Result<Index> {
    let documents = load_documents(&config.corpus)?;
    build_and_persist(config, documents, embedder).await
}

async fn build_and_persist(
    config: &Config,
    documents: Vec<Document>,
    embedder: &dyn Embedder,
) -> Result<Index> {
    let index = build_index(
        documents,
        embedder,
        config.chunking.max_tokens,
        config.embedding.batch_size,
    )
    .await?;
    persist_snapshot(&config.storage.dir, &index)?;
    info!(
        documents = index.documents().len(),
        chunks = index.len(),
        model = %index.meta().embedding_model,
        "index built"
    );
    Ok(index)
}

/// Chunk and embed `documents` into a new [`Index`].
///
/// Embedding requests are sent `batch_size` chunks at a time. Any provider
/// failure aborts the build; no partial index is produced.
pub async fn build_index(
    documents: Vec<Document>,
    embedder: &dyn Embedder,
    max_tokens: usize,
    batch_size: usize,
) -> Result<Index> {
    let chunks: Vec<Chunk> = documents
        .iter()
        .flat_map(|doc| chunk_document(doc, max_tokens))
        .collect();
    if chunks.is_empty() {
        bail!("corpus produced no chunks");
    }

    let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
    for batch in chunks.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = embedder
            .embed(&texts)
            .await
            .context("Embedding provider failed during index build")?;
        if vectors.len() != texts.len() {
            bail!(
                "Embedding provider returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            );
        }
        embeddings.extend(vectors);
    }

    let dims = match embedder.dims() {
        0 => embeddings.first().map(Vec::len).unwrap_or(0),
        d => d,
    };
    let meta = IndexMeta {
        version: INDEX_FORMAT_VERSION,
        embedding_model: embedder.model_name().to_string(),
        dims,
        corpus_fingerprint: corpus_fingerprint(&documents),
        created_at: Utc::now(),
    };

    Index::from_parts(meta, documents, chunks, embeddings)
}

/// Write `index` to `dir` as a snapshot.
pub fn persist_snapshot(dir: &Path, index: &Index) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    let docstore = DocStoreFile {
        version: index.meta().version,
        documents: index.documents().to_vec(),
        chunks: index.chunks().cloned().collect(),
    };
    let vectors = VectorStoreFile {
        vectors: index
            .entries()
            .iter()
            .map(|e| (e.chunk.id.clone(), STANDARD.encode(vec_to_blob(&e.embedding))))
            .collect(),
    };
    let docstore_bytes = serde_json::to_vec(&docstore)?;
    let vector_bytes = serde_json::to_vec(&vectors)?;
    let index_store = IndexStoreFile {
        meta: index.meta().clone(),
        docstore_sha256: sha256_hex(&docstore_bytes),
        vector_store_sha256: sha256_hex(&vector_bytes),
    };
    let index_bytes = serde_json::to_vec_pretty(&index_store)?;

    let primary = dir.join(DOCSTORE_FILE);
    if primary.exists() {
        std::fs::remove_file(&primary)
            .with_context(|| format!("Failed to remove {}", primary.display()))?;
    }
    write_atomic(dir, VECTOR_STORE_FILE, &vector_bytes)?;
    write_atomic(dir, INDEX_STORE_FILE, &index_bytes)?;
    write_atomic(dir, DOCSTORE_FILE, &docstore_bytes)?;
    Ok(())
}

fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let target = dir.join(name);
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(&target)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to publish {}", target.display()))?;
    Ok(())
}

/// Read and verify the snapshot in `dir`.
///
/// `expected_model` is the embedding model queries will be embedded with;
/// a snapshot built with another model is rejected.
pub fn load_snapshot(dir: &Path, expected_model: &str) -> Result<Index, SnapshotError> {
    let primary = dir.join(DOCSTORE_FILE);
    if !primary.exists() {
        return Err(SnapshotError::Missing(dir.to_path_buf()));
    }

    let index_store: IndexStoreFile = parse(INDEX_STORE_FILE, &read(&dir.join(INDEX_STORE_FILE))?)?;
    let meta = index_store.meta;
    check_version(meta.version)?;
    if meta.embedding_model != expected_model {
        return Err(SnapshotError::ModelMismatch {
            found: meta.embedding_model,
            expected: expected_model.to_string(),
        });
    }

    let docstore_bytes = read(&primary)?;
    if sha256_hex(&docstore_bytes) != index_store.docstore_sha256 {
        return Err(SnapshotError::Checksum(DOCSTORE_FILE));
    }
    let vector_bytes = read(&dir.join(VECTOR_STORE_FILE))?;
    if sha256_hex(&vector_bytes) != index_store.vector_store_sha256 {
        return Err(SnapshotError::Checksum(VECTOR_STORE_FILE));
    }

    let docstore: DocStoreFile = parse(DOCSTORE_FILE, &docstore_bytes)?;
    check_version(docstore.version)?;
    let mut vectors: VectorStoreFile = parse(VECTOR_STORE_FILE, &vector_bytes)?;

    let mut embeddings = Vec::with_capacity(docstore.chunks.len());
    for chunk in &docstore.chunks {
        let encoded = vectors.vectors.remove(&chunk.id).ok_or_else(|| {
            SnapshotError::Invalid(format!("chunk {} has no embedding", chunk.id))
        })?;
        embeddings.push(decode_vector(&chunk.id, &encoded)?);
    }
    if !vectors.vectors.is_empty() {
        return Err(SnapshotError::Invalid(format!(
            "{} embeddings have no chunk",
            vectors.vectors.len()
        )));
    }

    Index::from_parts(meta, docstore.documents, docstore.chunks, embeddings)
        .map_err(|e| SnapshotError::Invalid(e.to_string()))
}

/// Report on the snapshot in `dir` without decoding vectors.
/// `Ok(None)` when there is no snapshot.
pub fn snapshot_status(dir: &Path) -> Result<Option<SnapshotStatus>, SnapshotError> {
    let primary = dir.join(DOCSTORE_FILE);
    if !primary.exists() {
        return Ok(None);
    }
    let index_store: IndexStoreFile = parse(INDEX_STORE_FILE, &read(&dir.join(INDEX_STORE_FILE))?)?;
    let docstore_bytes = read(&primary)?;
    if sha256_hex(&docstore_bytes) != index_store.docstore_sha256 {
        return Err(SnapshotError::Checksum(DOCSTORE_FILE));
    }
    let docstore: DocStoreFile = parse(DOCSTORE_FILE, &docstore_bytes)?;

    Ok(Some(SnapshotStatus {
        meta: index_store.meta,
        documents: docstore.documents.len(),
        chunks: docstore.chunks.len(),
    }))
}

fn read(path: &Path) -> Result<Vec<u8>, SnapshotError> {
    std::fs::read(path).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse<T: serde::de::DeserializeOwned>(file: &'static str, bytes: &[u8]) -> Result<T, SnapshotError> {
    serde_json::from_slice(bytes).map_err(|e| SnapshotError::Malformed {
        file,
        message: e.to_string(),
    })
}

fn check_version(found: u32) -> Result<(), SnapshotError> {
    if found != INDEX_FORMAT_VERSION {
        return Err(SnapshotError::Version {
            found,
            expected: INDEX_FORMAT_VERSION,
        });
    }
    Ok(())
}

fn decode_vector(chunk_id: &str, encoded: &str) -> Result<Vec<f32>, SnapshotError> {
    let bytes = STANDARD.decode(encoded).map_err(|e| SnapshotError::Malformed {
        file: VECTOR_STORE_FILE,
        message: format!("chunk {}: {}", chunk_id, e),
    })?;
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(SnapshotError::Malformed {
            file: VECTOR_STORE_FILE,
            message: format!("chunk {}: {} bytes is not a whole f32 vector", chunk_id, bytes.len()),
        });
    }
    Ok(blob_to_vec(&bytes))
}
