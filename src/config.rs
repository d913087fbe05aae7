//! TOML configuration.
//!
//! Every section and every field has a default, so an empty file (or no file
//! at all, see `main.rs`) yields a working OpenAI-backed setup that reads
//! `./data` and persists to `./storage`.
//!
//! ```toml
//! [corpus]
//! dir = "data"
//!
//! [retrieval]
//! top_k = 3
//!
//! [generation]
//! model = "gpt-4o-mini"
//! response_mode = "tree_summarize"
//!
//! [guardrail]
//! enabled = true
//! keywords = ["constitution", "amendment"]
//! ```
//!
//! See `config/docchat.example.toml` for every option.

use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use docchat_core::guardrail::Guardrail;
use docchat_core::prompt::{PromptTemplate, DEFAULT_TEMPLATE};
use docchat_core::validate::CANNOT_ANSWER;

use crate::error::ConfigError;

/// Environment variable holding the OpenAI API key.
pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";

/// Config path used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "./config/docchat.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub guardrail: GuardrailConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    #[serde(default = "default_corpus_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            dir: default_corpus_dir(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_corpus_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.pdf".to_string(),
        "**/*.docx".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("storage")
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IndexConfig {
    /// Rebuild when the corpus on disk no longer matches the snapshot's
    /// fingerprint. Costs one full corpus read per startup.
    #[serde(default)]
    pub verify_corpus: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_openai")]
    pub provider: String,
    /// Defaults per provider: `text-embedding-ada-002` (openai),
    /// `nomic-embed-text` (ollama), `all-minilm-l6-v2` (local).
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL override (OpenAI-compatible server or Ollama host).
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_openai(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
            url: None,
        }
    }
}

impl EmbeddingConfig {
    /// The same provider with retries off. Query-time embedding makes one
    /// attempt; `max_retries` applies to index rebuilds only.
    pub fn for_queries(&self) -> Self {
        Self {
            max_retries: 0,
            ..self.clone()
        }
    }
}

fn default_openai() -> String {
    "openai".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub min_score: Option<f32>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: None,
        }
    }
}

fn default_top_k() -> usize {
    1
}

/// How retrieved chunks are turned into generation calls.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// Pack as many chunks as fit into one prompt.
    #[default]
    Compact,
    /// Answer per group of chunks, then combine the partial answers.
    TreeSummarize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_openai")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub response_mode: ResponseMode,
    /// Token budget of the model's context window.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Tokens reserved for the answer.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: usize,
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_openai(),
            model: default_generation_model(),
            temperature: 0.0,
            response_mode: ResponseMode::default(),
            context_window: default_context_window(),
            max_output_tokens: default_max_output_tokens(),
            streaming: true,
            timeout_secs: default_generation_timeout_secs(),
            url: None,
        }
    }
}

fn default_generation_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn default_context_window() -> usize {
    2048
}
fn default_max_output_tokens() -> usize {
    256
}
fn default_true() -> bool {
    true
}
fn default_generation_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromptConfig {
    #[serde(default = "default_template")]
    pub template: String,
    /// Number of most recent chat messages passed to the model.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            template: default_template(),
            history_window: default_history_window(),
        }
    }
}

fn default_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}
fn default_history_window() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct GuardrailConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_refusal")]
    pub refusal: String,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            keywords: Vec::new(),
            refusal: default_refusal(),
        }
    }
}

fn default_refusal() -> String {
    "I can only answer questions related to my knowledge base.".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    #[serde(default = "default_cannot_answer")]
    pub cannot_answer: String,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            cannot_answer: default_cannot_answer(),
        }
    }
}

fn default_cannot_answer() -> String {
    CANNOT_ANSWER.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl GuardrailConfig {
    pub fn build(&self) -> Guardrail {
        if self.enabled {
            Guardrail::new(&self.keywords)
        } else {
            Guardrail::disabled()
        }
    }
}

impl Config {
    /// Check value ranges and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunking.max_tokens == 0 {
            return Err(ConfigError::invalid("chunking.max_tokens must be > 0"));
        }

        match self.embedding.provider.as_str() {
            "openai" | "ollama" | "local" => {}
            other => {
                return Err(ConfigError::invalid(format!(
                    "unknown embedding provider: '{}'. Must be openai, ollama, or local.",
                    other
                )))
            }
        }
        if self.embedding.batch_size == 0 {
            return Err(ConfigError::invalid("embedding.batch_size must be > 0"));
        }
        if self.embedding.dims == Some(0) {
            return Err(ConfigError::invalid("embedding.dims must be > 0"));
        }

        if self.retrieval.top_k < 1 {
            return Err(ConfigError::invalid("retrieval.top_k must be >= 1"));
        }
        if let Some(min) = self.retrieval.min_score {
            if !(-1.0..=1.0).contains(&min) {
                return Err(ConfigError::invalid(
                    "retrieval.min_score must be in [-1.0, 1.0]",
                ));
            }
        }

        let generation = &self.generation;
        match generation.provider.as_str() {
            "openai" | "ollama" => {}
            other => {
                return Err(ConfigError::invalid(format!(
                    "unknown generation provider: '{}'. Must be openai or ollama.",
                    other
                )))
            }
        }
        if !(0.0..=1.0).contains(&generation.temperature) {
            return Err(ConfigError::invalid(
                "generation.temperature must be in [0.0, 1.0]",
            ));
        }
        if generation.context_window == 0 {
            return Err(ConfigError::invalid("generation.context_window must be > 0"));
        }
        if generation.max_output_tokens == 0 {
            return Err(ConfigError::invalid(
                "generation.max_output_tokens must be > 0",
            ));
        }
        if generation.max_output_tokens >= generation.context_window {
            return Err(ConfigError::invalid(
                "generation.max_output_tokens must be smaller than generation.context_window",
            ));
        }

        PromptTemplate::new(self.prompt.template.as_str())
            .map_err(|e| ConfigError::invalid(e.to_string()))?;

        if self.guardrail.enabled && self.guardrail.refusal.trim().is_empty() {
            return Err(ConfigError::invalid("guardrail.refusal must not be empty"));
        }
        if self.validation.cannot_answer.trim().is_empty() {
            return Err(ConfigError::invalid(
                "validation.cannot_answer must not be empty",
            ));
        }

        Ok(())
    }

    /// Whether any configured backend talks to the OpenAI API.
    pub fn uses_openai(&self) -> bool {
        self.embedding.provider == "openai" || self.generation.provider == "openai"
    }
}

/// Read and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(path, &content)?;
    Ok(config)
}

/// Like [`load_config`], but a missing file at [`DEFAULT_CONFIG_PATH`] yields
/// the defaults. A missing file anywhere else is still an error.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if path == Path::new(DEFAULT_CONFIG_PATH) && !path.exists() {
        debug!(path = %path.display(), "no config file, using defaults");
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    }
    load_config(path)
}

fn parse_config(path: &Path, content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

/// The OpenAI API key from the environment.
pub fn openai_api_key() -> Result<String, ConfigError> {
    match std::env::var(OPENAI_API_KEY) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(ConfigError::MissingCredential(OPENAI_API_KEY)),
    }
}
