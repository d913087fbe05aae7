//! Generation backends.
//!
//! A [`Generator`] turns a composed prompt into text, either in one piece
//! ([`Generator::complete`]) or as a stream of fragments
//! ([`Generator::stream`]). [`generate`] is the boundary the pipeline calls:
//! it picks the mode from [`GenerationConfig::streaming`] and converts every
//! [`BackendError`] into [`Generation::Failed`].
//!
//! Streaming answers are forwarded through a bounded channel by a spawned
//! task. Dropping the returned [`FragmentStream`] closes the channel and the
//! task stops at its next send, which also drops the HTTP response.
//!
//! Backends:
//! - [`OpenAIChat`]: `POST {base}/chat/completions`, server-sent events when
//!   streaming (`data: {...}` lines terminated by `data: [DONE]`).
//! - [`OllamaChat`]: `POST {url}/api/generate`, newline-delimited JSON when
//!   streaming.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::config::{openai_api_key, GenerationConfig};

/// Fragments of a streaming answer, in arrival order.
pub type FragmentStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Raw fragment stream produced by a backend.
pub type BackendStream = BoxStream<'static, Result<String, BackendError>>;

type ByteStream = BoxStream<'static, Result<Vec<u8>, BackendError>>;

/// Capacity of the fragment channel between backend and consumer.
const FRAGMENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("request timed out")]
    Timeout,
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("quota exceeded: {0}")]
    Quota(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout
        } else if e.is_decode() {
            BackendError::Malformed(e.to_string())
        } else {
            BackendError::Transport(e.to_string())
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    /// Generate the full answer for `prompt`.
    async fn complete(&self, prompt: &str, config: &GenerationConfig) -> Result<String, BackendError>;

    /// Start generating `prompt`, returning fragments as they arrive.
    async fn stream(&self, prompt: &str, config: &GenerationConfig) -> Result<BackendStream, BackendError>;
}

/// Outcome of a generation call.
pub enum Generation {
    Answer(String),
    Stream(FragmentStream),
    Failed(String),
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Generation::Answer(text) => f.debug_tuple("Answer").field(text).finish(),
            Generation::Stream(_) => f.write_str("Stream(..)"),
            Generation::Failed(reason) => f.debug_tuple("Failed").field(reason).finish(),
        }
    }
}

/// Run `prompt` through `generator`. Never fails: backend errors become
/// [`Generation::Failed`].
pub async fn generate(generator: &dyn Generator, prompt: &str, config: &GenerationConfig) -> Generation {
    if !config.streaming {
        return match generator.complete(prompt, config).await {
            Ok(text) => Generation::Answer(text),
            Err(e) => {
                warn!(backend = generator.name(), error = %e, "generation failed");
                Generation::Failed(e.to_string())
            }
        };
    }

    match generator.stream(prompt, config).await {
        Ok(upstream) => Generation::Stream(forward(upstream)),
        Err(e) => {
            warn!(backend = generator.name(), error = %e, "generation stream failed to start");
            Generation::Failed(e.to_string())
        }
    }
}

/// Pump `upstream` into a channel from a spawned task. The first error ends
/// the stream.
fn forward(mut upstream: BackendStream) -> FragmentStream {
    let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);
    tokio::spawn(async move {
        while let Some(item) = upstream.next().await {
            match item {
                Ok(fragment) if fragment.is_empty() => continue,
                Ok(fragment) => {
                    if tx.send(fragment).await.is_err() {
                        debug!("fragment consumer dropped, cancelling generation");
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "generation stream terminated");
                    break;
                }
            }
        }
    });
    Box::pin(ReceiverStream::new(rx))
}

/// Create the [`Generator`] selected by `generation.provider`.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIChat::new(
            config.url.as_deref(),
            openai_api_key()?,
            config.timeout_secs,
        )?)),
        "ollama" => Ok(Arc::new(OllamaChat::new(config.url.as_deref(), config.timeout_secs)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.as_u16() == 429 {
        Err(BackendError::Quota(body))
    } else {
        Err(BackendError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn byte_stream(response: reqwest::Response) -> ByteStream {
    response
        .bytes_stream()
        .map(|chunk| chunk.map(|b| b.to_vec()).map_err(BackendError::from))
        .boxed()
}

// ============ Line decoding ============

/// Splits a byte stream into `\n`-terminated lines.
struct LineReader {
    inner: ByteStream,
    buf: Vec<u8>,
    done: bool,
}

impl LineReader {
    fn new(inner: ByteStream) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            done: false,
        }
    }

    async fn next_line(&mut self) -> Option<Result<String, BackendError>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                return Some(Ok(line.trim_end_matches(['\r', '\n']).to_string()));
            }
            if self.done {
                if self.buf.is_empty() {
                    return None;
                }
                let rest = std::mem::take(&mut self.buf);
                return Some(Ok(String::from_utf8_lossy(&rest).trim_end().to_string()));
            }
            match self.inner.next().await {
                Some(Ok(bytes)) => self.buf.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    self.done = true;
                    self.buf.clear();
                    return Some(Err(e));
                }
                None => self.done = true,
            }
        }
    }
}

/// What one line of a streaming body means.
#[derive(Debug, PartialEq)]
enum StreamLine {
    Skip,
    Fragment(String),
    Done,
    Invalid(String),
}

/// Decode a line-oriented body with `parse`, stopping at `Done`, the end
/// of the body or the first error.
fn decode_lines(bytes: ByteStream, parse: fn(&str) -> StreamLine) -> BackendStream {
    stream::unfold(Some(LineReader::new(bytes)), move |state| async move {
        let mut reader = state?;
        loop {
            match reader.next_line().await? {
                Err(e) => return Some((Err(e), None)),
                Ok(line) => match parse(&line) {
                    StreamLine::Skip => continue,
                    StreamLine::Done => return None,
                    StreamLine::Fragment(text) => return Some((Ok(text), Some(reader))),
                    StreamLine::Invalid(message) => {
                        return Some((Err(BackendError::Malformed(message)), None))
                    }
                },
            }
        }
    })
    .boxed()
}

// ============ OpenAI-compatible chat ============

/// Chat-completions client for the OpenAI API or any compatible server.
///
/// The composed prompt is sent as a single user message.
pub struct OpenAIChat {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl OpenAIChat {
    pub fn new(base_url: Option<&str>, api_key: String, timeout_secs: u64) -> Result<Self> {
        let base = base_url.unwrap_or(crate::embedding::OPENAI_BASE_URL);
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()?,
            endpoint: format!("{}/chat/completions", base.trim_end_matches('/')),
            api_key,
        })
    }

    async fn send(&self, prompt: &str, config: &GenerationConfig, stream: bool) -> Result<reqwest::Response, BackendError> {
        let body = serde_json::json!({
            "model": config.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": config.temperature,
            "max_tokens": config.max_output_tokens,
            "stream": stream,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        check_status(response).await
    }
}

#[async_trait]
impl Generator for OpenAIChat {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, prompt: &str, config: &GenerationConfig) -> Result<String, BackendError> {
        let json: serde_json::Value = self.send(prompt, config, false).await?.json().await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| BackendError::Malformed("missing choices[0].message.content".to_string()))
    }

    async fn stream(&self, prompt: &str, config: &GenerationConfig) -> Result<BackendStream, BackendError> {
        let response = self.send(prompt, config, true).await?;
        Ok(decode_lines(byte_stream(response), parse_openai_sse_line))
    }
}

fn parse_openai_sse_line(line: &str) -> StreamLine {
    let Some(data) = line.strip_prefix("data:") else {
        return StreamLine::Skip;
    };
    let data = data.trim();
    if data.is_empty() {
        return StreamLine::Skip;
    }
    if data == "[DONE]" {
        return StreamLine::Done;
    }
    match serde_json::from_str::<serde_json::Value>(data) {
        Ok(json) => {
            if let Some(error) = json.get("error") {
                return StreamLine::Invalid(error.to_string());
            }
            match json.pointer("/choices/0/delta/content").and_then(|c| c.as_str()) {
                Some(text) if !text.is_empty() => StreamLine::Fragment(text.to_string()),
                _ => StreamLine::Skip,
            }
        }
        Err(e) => StreamLine::Invalid(e.to_string()),
    }
}

// ============ Ollama ============

/// Client for Ollama's `/api/generate`.
pub struct OllamaChat {
    client: reqwest::Client,
    endpoint: String,
}

impl OllamaChat {
    pub fn new(url: Option<&str>, timeout_secs: u64) -> Result<Self> {
        let url = url.unwrap_or(crate::embedding::OLLAMA_URL);
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()?,
            endpoint: format!("{}/api/generate", url.trim_end_matches('/')),
        })
    }

    async fn send(&self, prompt: &str, config: &GenerationConfig, stream: bool) -> Result<reqwest::Response, BackendError> {
        let body = serde_json::json!({
            "model": config.model,
            "prompt": prompt,
            "stream": stream,
            "options": {
                "temperature": config.temperature,
                "num_predict": config.max_output_tokens,
                "num_ctx": config.context_window,
            },
        });
        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        check_status(response).await
    }
}

#[async_trait]
impl Generator for OllamaChat {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, prompt: &str, config: &GenerationConfig) -> Result<String, BackendError> {
        let json: serde_json::Value = self.send(prompt, config, false).await?.json().await?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| BackendError::Malformed("missing response field".to_string()))
    }

    async fn stream(&self, prompt: &str, config: &GenerationConfig) -> Result<BackendStream, BackendError> {
        let response = self.send(prompt, config, true).await?;
        Ok(decode_lines(byte_stream(response), parse_ollama_line))
    }
}

fn parse_ollama_line(line: &str) -> StreamLine {
    let line = line.trim();
    if line.is_empty() {
        return StreamLine::Skip;
    }
    let json: serde_json::Value = match serde_json::from_str(line) {
        Ok(json) => json,
        Err(e) => return StreamLine::Invalid(e.to_string()),
    };
    if let Some(error) = json.get("error") {
        return StreamLine::Invalid(error.to_string());
    }
    let text = json.get("response").and_then(|r| r.as_str()).unwrap_or_default();
    if !text.is_empty() {
        return StreamLine::Fragment(text.to_string());
    }
    if json.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
        StreamLine::Done
    } else {
        StreamLine::Skip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(parts: &[&str]) -> ByteStream {
        let items: Vec<Result<Vec<u8>, BackendError>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        stream::iter(items).boxed()
    }

    async fn collect(stream: BackendStream) -> Vec<Result<String, BackendError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_sse_lines_split_across_chunks() {
        let body = bytes(&[
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\nda",
            "ta: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            ": keep-alive\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\r\n\r\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        ]);
        let out = collect(decode_lines(body, parse_openai_sse_line)).await;
        let text: Vec<String> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(text, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn test_sse_multibyte_split() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"§ 1\"}}]}\n";
        let raw = line.as_bytes();
        let split = raw.iter().position(|&b| b == 0xC2).unwrap() + 1;
        let items: Vec<Result<Vec<u8>, BackendError>> =
            vec![Ok(raw[..split].to_vec()), Ok(raw[split..].to_vec())];
        let out = collect(decode_lines(stream::iter(items).boxed(), parse_openai_sse_line)).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap(), "§ 1");
    }

    #[tokio::test]
    async fn test_sse_garbage_ends_stream_with_error() {
        let body = bytes(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n",
            "data: {not json\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n",
        ]);
        let out = collect(decode_lines(body, parse_openai_sse_line)).await;
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], Err(BackendError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_ollama_ndjson() {
        let body = bytes(&[
            "{\"response\":\"We \",\"done\":false}\n{\"response\":\"the\",",
            "\"done\":false}\n{\"response\":\"\",\"done\":true}\n",
        ]);
        let out = collect(decode_lines(body, parse_ollama_line)).await;
        let text: Vec<String> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(text, vec!["We ", "the"]);
    }

    #[test]
    fn test_parse_sse_line_variants() {
        assert_eq!(parse_openai_sse_line(""), StreamLine::Skip);
        assert_eq!(parse_openai_sse_line("event: ping"), StreamLine::Skip);
        assert_eq!(parse_openai_sse_line("data: [DONE]"), StreamLine::Done);
        assert!(matches!(
            parse_openai_sse_line("data: {\"error\":{\"message\":\"quota\"}}"),
            StreamLine::Invalid(_)
        ));
    }

    /// Yields the given items, then ends.
    struct Scripted {
        items: Vec<Result<String, BackendError>>,
        fail_start: bool,
    }

    #[async_trait]
    impl Generator for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn complete(&self, _prompt: &str, _config: &GenerationConfig) -> Result<String, BackendError> {
            if self.fail_start {
                return Err(BackendError::Timeout);
            }
            Ok(self
                .items
                .iter()
                .filter_map(|r| r.as_ref().ok().cloned())
                .collect())
        }
        async fn stream(&self, _prompt: &str, _config: &GenerationConfig) -> Result<BackendStream, BackendError> {
            if self.fail_start {
                return Err(BackendError::Quota("slow down".into()));
            }
            Ok(stream::iter(self.items.clone()).boxed())
        }
    }

    fn config(streaming: bool) -> GenerationConfig {
        GenerationConfig {
            streaming,
            ..GenerationConfig::default()
        }
    }

    #[tokio::test]
    async fn test_generate_non_streaming() {
        let g = Scripted {
            items: vec![Ok("a".into()), Ok("b".into())],
            fail_start: false,
        };
        match generate(&g, "p", &config(false)).await {
            Generation::Answer(text) => assert_eq!(text, "ab"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generate_stream_stops_at_first_error() {
        let g = Scripted {
            items: vec![
                Ok("one ".into()),
                Ok(String::new()),
                Ok("two".into()),
                Err(BackendError::Timeout),
                Ok("three".into()),
            ],
            fail_start: false,
        };
        let Generation::Stream(stream) = generate(&g, "p", &config(true)).await else {
            panic!("expected a stream");
        };
        let fragments: Vec<String> = stream.collect().await;
        assert_eq!(fragments, vec!["one ", "two"]);
    }

    #[tokio::test]
    async fn test_generate_failures_are_values() {
        let g = Scripted {
            items: vec![],
            fail_start: true,
        };
        match generate(&g, "p", &config(false)).await {
            Generation::Failed(reason) => assert_eq!(reason, "request timed out"),
            other => panic!("unexpected {:?}", other),
        }
        match generate(&g, "p", &config(true)).await {
            Generation::Failed(reason) => assert!(reason.contains("quota")),
            other => panic!("unexpected {:?}", other),
        }
    }

    /// Streams 10 000 fragments, counting how many were pulled.
    struct Counting {
        pulled: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl Generator for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        async fn complete(&self, _prompt: &str, _config: &GenerationConfig) -> Result<String, BackendError> {
            Err(BackendError::Timeout)
        }
        async fn stream(&self, _prompt: &str, _config: &GenerationConfig) -> Result<BackendStream, BackendError> {
            let pulled = self.pulled.clone();
            Ok(stream::iter((0..10_000).map(|i| Ok(format!("{} ", i))))
                .inspect(move |_| {
                    pulled.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })
                .boxed())
        }
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_producer() {
        use std::sync::atomic::Ordering;

        let pulled = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let g = Counting {
            pulled: pulled.clone(),
        };
        let Generation::Stream(mut stream) = generate(&g, "p", &config(true)).await else {
            panic!("expected a stream");
        };
        assert_eq!(stream.next().await.as_deref(), Some("0 "));
        drop(stream);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_drop = pulled.load(Ordering::SeqCst);
        assert!(after_drop <= FRAGMENT_BUFFER + 2, "pulled {}", after_drop);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pulled.load(Ordering::SeqCst), after_drop);
    }

    #[test]
    fn test_openai_endpoint() {
        let chat = OpenAIChat::new(Some("http://localhost:1234/v1/"), "k".into(), 5).unwrap();
        assert_eq!(chat.endpoint, "http://localhost:1234/v1/chat/completions");
        let default = OpenAIChat::new(None, "k".into(), 5).unwrap();
        assert_eq!(default.endpoint, "https://api.openai.com/v1/chat/completions");
    }
}
