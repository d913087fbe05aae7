//! Deterministic embedding and generation doubles shared by the
//! integration tests.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use docchat::config::{Config, GenerationConfig};
use docchat::generation::{BackendError, BackendStream, Generator};
use docchat::pipeline::{PipelineConfig, QueryPipeline};
use docchat::store::build_index;
use docchat_core::embedding::Embedder;
use docchat_core::models::Document;

pub const DIMS: usize = 64;

/// Bag-of-words embedder: each lowercase word adds 1.0 to a bucket chosen
/// by a stable hash of the word.
#[derive(Default)]
pub struct HashEmbedder {
    pub calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn hash_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let word = word.to_lowercase();
        let mut h: u64 = 0xcbf29ce484222325;
        for b in word.bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        v[(h % DIMS as u64) as usize] += 1.0;
    }
    v
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-bow"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| hash_vector(t)).collect())
    }
}

/// How [`ScriptedGenerator`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// A deterministic multi-word answer derived from the prompt.
    Answer,
    /// An empty answer.
    Blank,
    /// Every call fails.
    Fail,
}

/// Generator whose answer is a pure function of the prompt. Streams the
/// same answer split after each space.
pub struct ScriptedGenerator {
    pub behavior: Behavior,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }

    fn answer(&self, prompt: &str) -> Result<String, BackendError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.behavior {
            Behavior::Answer => Ok(answer_for(prompt)),
            Behavior::Blank => Ok(String::new()),
            Behavior::Fail => Err(BackendError::Status {
                status: 500,
                body: "boom".to_string(),
            }),
        }
    }
}

pub fn answer_for(prompt: &str) -> String {
    format!(
        "The context has {} lines and {} words in total.",
        prompt.lines().count(),
        prompt.split_whitespace().count()
    )
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str, _config: &GenerationConfig) -> Result<String, BackendError> {
        self.answer(prompt)
    }

    async fn stream(&self, prompt: &str, _config: &GenerationConfig) -> Result<BackendStream, BackendError> {
        let answer = self.answer(prompt)?;
        let pieces: Vec<Result<String, BackendError>> = answer
            .split_inclusive(' ')
            .map(|p| Ok(p.to_string()))
            .collect();
        Ok(stream::iter(pieces).boxed())
    }
}

pub fn corpus() -> Vec<Document> {
    vec![
        Document::new(
            "amendments.md",
            "text/markdown",
            "The first amendment protects freedom of speech and religion.\n\n\
             The second amendment concerns the right to bear arms.",
        ),
        Document::new(
            "articles.md",
            "text/markdown",
            "Article one establishes the legislative branch, the Congress.\n\n\
             Article two establishes the executive branch and the president.",
        ),
    ]
}

/// A pipeline over [`corpus`] with one chunk per paragraph.
pub async fn pipeline(
    config: &Config,
    embedder: Arc<HashEmbedder>,
    generator: Arc<ScriptedGenerator>,
) -> Result<QueryPipeline> {
    let index = build_index(corpus(), embedder.as_ref(), 16, 8).await?;
    if index.len() != 4 {
        bail!("expected 4 chunks, got {}", index.len());
    }
    Ok(QueryPipeline::new(
        Arc::new(index),
        embedder,
        generator,
        PipelineConfig::from_config(config)?,
    ))
}
