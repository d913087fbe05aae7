//! Query pipeline.
//!
//! [`QueryPipeline`] owns everything a query needs: the loaded [`Index`]
//! (shared read-only), the embedding and generation clients, and the
//! [`PipelineConfig`] fixed at construction. It keeps no conversation state;
//! callers pass their history with each [`QueryRequest`] (see
//! [`crate::session::ChatSession`]).
//!
//! Per query:
//!
//! ```text
//! guardrail ─▶ embed query ─▶ retrieve ─▶ synthesize ─▶ validate ─▶ QueryResponse
//!     │                          │            │             │
//!     └─ refusal                 └─ no chunks └─ failed     └─ empty
//!                                   cannot answer (no generation call)
//! ```
//!
//! [`QueryPipeline::query`] never fails. Every failure mode is mapped to a
//! well-formed response carrying either the guardrail refusal or the
//! "cannot answer" message.

use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use docchat_core::embedding::{embed_one, Embedder};
use docchat_core::guardrail::{Guardrail, Scope};
use docchat_core::index::Index;
use docchat_core::models::{ChatMessage, ScoredChunk};
use docchat_core::prompt::{window, PromptTemplate};
use docchat_core::retrieve::RetrieveParams;
use docchat_core::validate::{validate, validate_sources, RejectReason, Validation};

use crate::config::{openai_api_key, Config, GenerationConfig};
use crate::embedding::create_embedder;
use crate::generation::{create_generator, FragmentStream, Generation, Generator};
use crate::store::load_or_build;
use crate::synth::synthesize;

/// Query-time settings, resolved once from [`Config`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub template: PromptTemplate,
    pub guardrail: Guardrail,
    pub refusal: String,
    pub cannot_answer: String,
    pub retrieve: RetrieveParams,
    pub history_window: usize,
    pub generation: GenerationConfig,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            template: PromptTemplate::new(config.prompt.template.as_str())?,
            guardrail: config.guardrail.build(),
            refusal: config.guardrail.refusal.clone(),
            cannot_answer: config.validation.cannot_answer.clone(),
            retrieve: RetrieveParams {
                top_k: config.retrieval.top_k,
                min_score: config.retrieval.min_score,
            },
            history_window: config.prompt.history_window,
            generation: config.generation.clone(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    /// Earlier turns, oldest first. Only the last `prompt.history_window`
    /// messages are used.
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            chat_history: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.chat_history = history;
        self
    }
}

/// Result of a query.
///
/// A streaming response has empty `text` and carries its answer in
/// [`take_fragments`](Self::take_fragments); [`into_text`](Self::into_text)
/// works for both kinds.
///
/// A stream that ends blank is completed with the "cannot answer" message.
/// Its `sources` and `valid` only reflect that once [`settle`](Self::settle)
/// is called after the stream has been drained; [`finish`](Self::finish)
/// does both.
pub struct QueryResponse {
    pub text: String,
    pub sources: Vec<ScoredChunk>,
    pub valid: bool,
    fragments: Option<FragmentStream>,
    refused: Arc<AtomicBool>,
}

impl QueryResponse {
    /// A fixed, non-streaming answer with no sources.
    fn fixed(text: &str) -> Self {
        Self {
            text: text.to_string(),
            sources: Vec::new(),
            valid: false,
            fragments: None,
            refused: Arc::new(AtomicBool::new(false)),
        }
    }

    fn answered(text: String, sources: Vec<ScoredChunk>, fragments: Option<FragmentStream>) -> Self {
        Self {
            text,
            sources,
            valid: true,
            fragments,
            refused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.fragments.is_some()
    }

    /// Text of the best-scoring source chunk.
    pub fn source_text(&self) -> Option<&str> {
        self.sources.first().map(|s| s.chunk.text.as_str())
    }

    /// The fragment stream, once. Later calls return `None`.
    pub fn take_fragments(&mut self) -> Option<FragmentStream> {
        self.fragments.take()
    }

    /// Whether the fragment stream ended blank and was replaced by the
    /// "cannot answer" message.
    pub fn stream_refused(&self) -> bool {
        self.refused.load(Ordering::SeqCst)
    }

    /// Drop the attribution of a stream that ended blank. Call once the
    /// fragments have been consumed.
    pub fn settle(&mut self) {
        if self.stream_refused() {
            self.sources.clear();
            self.valid = false;
        }
    }

    /// Drain the fragment stream into `text` and settle.
    pub async fn finish(mut self) -> Self {
        if let Some(fragments) = self.fragments.take() {
            let parts: Vec<String> = fragments.collect().await;
            self.text = parts.concat();
        }
        self.settle();
        self
    }

    /// The full answer, draining the fragment stream if there is one.
    pub async fn into_text(self) -> String {
        self.finish().await.text
    }
}

impl std::fmt::Debug for QueryResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResponse")
            .field("text", &self.text)
            .field("sources", &self.sources.len())
            .field("valid", &self.valid)
            .field("is_streaming", &self.is_streaming())
            .finish()
    }
}

pub struct QueryPipeline {
    index: Arc<Index>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    config: PipelineConfig,
}

impl QueryPipeline {
    pub fn new(
        index: Arc<Index>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            generator,
            config,
        }
    }

    /// Create the clients named in `config`, then load (or build) the index.
    ///
    /// Only the embedder used for a rebuild retries; the one kept for queries
    /// makes a single attempt.
    ///
    /// Fails with [`ConfigError::MissingCredential`](crate::error::ConfigError)
    /// before touching the corpus when an OpenAI backend is configured and
    /// `OPENAI_API_KEY` is unset.
    pub async fn from_config(config: &Config) -> Result<Self> {
        if config.uses_openai() {
            openai_api_key()?;
        }
        let pipeline_config = PipelineConfig::from_config(config)?;
        let embedder = create_embedder(&config.embedding.for_queries())?;
        let generator = create_generator(&config.generation)?;
        let index = {
            let rebuild_embedder = create_embedder(&config.embedding)?;
            load_or_build(config, rebuild_embedder.as_ref()).await?
        };
        info!(
            chunks = index.len(),
            embedder = embedder.model_name(),
            generator = generator.name(),
            "query pipeline ready"
        );
        Ok(Self::new(Arc::new(index), embedder, generator, pipeline_config))
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Answer `request`. Never fails.
    pub async fn query(&self, request: QueryRequest) -> QueryResponse {
        let query = request.query.trim();
        if query.is_empty() {
            debug!("empty query");
            return QueryResponse::fixed(&self.config.cannot_answer);
        }

        if self.config.guardrail.classify(query) == Scope::OutOfScope {
            info!("query out of scope, refusing");
            return QueryResponse::fixed(&self.config.refusal);
        }

        let query_vec = match embed_one(self.embedder.as_ref(), query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "query embedding failed");
                return QueryResponse::fixed(&self.config.cannot_answer);
            }
        };

        if query_vec.len() != self.index.meta().dims {
            warn!(
                got = query_vec.len(),
                expected = self.index.meta().dims,
                "query embedding does not match the index dimensionality"
            );
            return QueryResponse::fixed(&self.config.cannot_answer);
        }

        let sources = self.index.retrieve(&query_vec, self.config.retrieve);
        if let Validation::Rejected(reason) = validate_sources(&sources) {
            info!(%reason, "nothing to answer from");
            return QueryResponse::fixed(&self.config.cannot_answer);
        }
        debug!(
            retrieved = sources.len(),
            top_score = sources[0].score,
            "retrieved context"
        );

        let history = window(&request.chat_history, self.config.history_window);
        let texts: Vec<&str> = sources.iter().map(|s| s.chunk.text.as_str()).collect();
        let generation = synthesize(
            self.generator.as_ref(),
            &self.config.template,
            &self.config.generation,
            query,
            history,
            &texts,
        )
        .await;

        let rejection = match generation {
            Generation::Answer(text) => match validate(&text, &sources) {
                Validation::Valid => return QueryResponse::answered(text, sources, None),
                Validation::Rejected(reason) => reason,
            },
            Generation::Stream(fragments) => {
                let mut response = QueryResponse::answered(String::new(), sources, None);
                response.fragments = Some(refuse_if_empty(
                    fragments,
                    self.config.cannot_answer.clone(),
                    response.refused.clone(),
                ));
                return response;
            }
            Generation::Failed(reason) => RejectReason::GenerationFailed(reason),
        };

        warn!(reason = %rejection, "answer rejected");
        QueryResponse::fixed(&self.config.cannot_answer)
    }
}

/// Pass `inner` through; if it ends without any non-blank text, set
/// `refused` and emit `refusal` as a final fragment.
fn refuse_if_empty(inner: FragmentStream, refusal: String, refused: Arc<AtomicBool>) -> FragmentStream {
    Box::pin(stream::unfold(
        (inner, false, Some((refusal, refused))),
        |(mut inner, seen_text, pending)| async move {
            match inner.next().await {
                Some(fragment) => {
                    let seen_text = seen_text || !fragment.trim().is_empty();
                    Some((fragment, (inner, seen_text, pending)))
                }
                None if seen_text => None,
                None => {
                    let (refusal, refused) = pending?;
                    debug!("stream ended blank, emitting refusal");
                    refused.store(true, Ordering::SeqCst);
                    Some((refusal, (inner, true, None)))
                }
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docchat_core::models::Chunk;

    fn fragments(parts: &[&str]) -> FragmentStream {
        let owned: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
        Box::pin(stream::iter(owned))
    }

    fn source() -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                id: "c".to_string(),
                document_id: "d".to_string(),
                source: "d.md".to_string(),
                chunk_index: 0,
                text: "context".to_string(),
                hash: String::new(),
            },
            score: 0.9,
        }
    }

    fn streaming(parts: &[&str]) -> QueryResponse {
        let mut response = QueryResponse::answered(String::new(), vec![source()], None);
        response.fragments = Some(refuse_if_empty(
            fragments(parts),
            "no".into(),
            response.refused.clone(),
        ));
        response
    }

    #[tokio::test]
    async fn test_refuse_if_empty_passes_text_through() {
        let flag = Arc::new(AtomicBool::new(false));
        let out: Vec<String> = refuse_if_empty(fragments(&["a", "", "b"]), "no".into(), flag.clone())
            .collect()
            .await;
        assert_eq!(out, vec!["a", "", "b"]);
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_refuse_if_empty_appends_refusal() {
        let flag = Arc::new(AtomicBool::new(false));
        let out: Vec<String> = refuse_if_empty(fragments(&[]), "no".into(), flag.clone())
            .collect()
            .await;
        assert_eq!(out, vec!["no"]);
        assert!(flag.load(Ordering::SeqCst));

        let out: Vec<String> = refuse_if_empty(
            fragments(&[" ", "\n"]),
            "no".into(),
            Arc::new(AtomicBool::new(false)),
        )
        .collect()
        .await;
        assert_eq!(out.last().map(String::as_str), Some("no"));
    }

    #[tokio::test]
    async fn test_into_text_concatenates_fragments() {
        let response = streaming(&["The ", "answer", "."]);
        assert!(response.is_streaming());
        assert_eq!(response.into_text().await, "The answer.");
    }

    #[tokio::test]
    async fn test_finish_keeps_attribution_of_real_answer() {
        let response = streaming(&["yes"]).finish().await;
        assert!(!response.is_streaming());
        assert_eq!(response.text, "yes");
        assert!(response.valid);
        assert_eq!(response.sources.len(), 1);
    }

    #[tokio::test]
    async fn test_blank_stream_loses_attribution_once_settled() {
        let mut response = streaming(&[" "]);
        let fragments = response.take_fragments().unwrap();
        let out: Vec<String> = fragments.collect().await;
        assert_eq!(out.concat(), " no");
        assert!(response.stream_refused());

        response.settle();
        assert!(!response.valid);
        assert!(response.sources.is_empty());
        assert_eq!(response.source_text(), None);
    }

    #[test]
    fn test_request_history_defaults_to_empty() {
        let request: QueryRequest = serde_json::from_str(r#"{"query":"hi"}"#).unwrap();
        assert_eq!(request.query, "hi");
        assert!(request.chat_history.is_empty());
    }
}
