//! Core data models shared by the index and the query pipeline.
//!
//! [`Document`]s come out of the corpus loader, are split into [`Chunk`]s,
//! and chunks come back out of retrieval as [`ScoredChunk`]s. Conversation
//! turns are [`ChatMessage`]s owned by the caller.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A document read from the corpus. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Hex SHA-256 of `source`.
    pub id: String,
    /// Path relative to the corpus root (e.g. `"constitution/article-1.md"`).
    pub source: String,
    /// MIME type the body was read as.
    pub content_type: String,
    /// Normalized UTF-8 text.
    pub body: String,
}

impl Document {
    /// Create a document, deriving its id from `source`.
    pub fn new(
        source: impl Into<String>,
        content_type: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let source = source.into();
        Self {
            id: sha256_hex(source.as_bytes()),
            source,
            content_type: content_type.into(),
            body: body.into(),
        }
    }
}

/// A contiguous span of a document's text; the unit of retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic UUID derived from the document id and chunk index.
    pub id: String,
    /// Parent document id.
    pub document_id: String,
    /// Parent document source path, kept for attribution.
    pub source: String,
    /// Position within the parent document, starting at 0.
    pub chunk_index: i64,
    pub text: String,
    /// Hex SHA-256 of `text`.
    pub hash: String,
}

/// A retrieved chunk with its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub score: f32,
}

/// Speaker of a [`ChatMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Prefix used when a message is rendered into a prompt.
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// One turn of a conversation.
///
/// Deserializes from the `{ "role": "user", "content": "..." }` shape used by
/// the HTTP API; `source` is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Text of the passage the answer was grounded in, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            source: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: Option<String>) -> Self {
        self.source = source;
        self
    }
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
