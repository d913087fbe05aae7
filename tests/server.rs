mod common;

use serde_json::{json, Value};
use std::sync::Arc;

use common::{answer_for, Behavior, HashEmbedder, ScriptedGenerator};
use docchat::config::Config;
use docchat::server::router;
use docchat_core::validate::CANNOT_ANSWER;

async fn spawn_server(streaming: bool) -> (String, Arc<ScriptedGenerator>) {
    spawn_server_with(streaming, Behavior::Answer).await
}

async fn spawn_server_with(streaming: bool, behavior: Behavior) -> (String, Arc<ScriptedGenerator>) {
    let mut cfg = Config::default();
    cfg.generation.streaming = streaming;
    let generator = Arc::new(ScriptedGenerator::new(behavior));
    let pipeline = common::pipeline(&cfg, Arc::new(HashEmbedder::default()), generator.clone())
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(Arc::new(pipeline))).await.unwrap();
    });
    (format!("http://{}", addr), generator)
}

/// `(event, data)` pairs from a server-sent events body.
fn parse_sse(body: &str) -> Vec<(String, Value)> {
    body.split("\n\n")
        .filter_map(|block| {
            let mut event = None;
            let mut data = None;
            for line in block.lines() {
                if let Some(e) = line.strip_prefix("event:") {
                    event = Some(e.trim().to_string());
                } else if let Some(d) = line.strip_prefix("data:") {
                    data = serde_json::from_str(d.trim()).ok();
                }
            }
            Some((event?, data?))
        })
        .collect()
}

#[tokio::test]
async fn test_health() {
    let (base, _) = spawn_server(false).await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["chunks"], 4);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_query_returns_answer_and_sources() {
    let (base, generator) = spawn_server(true).await;
    let response = reqwest::Client::new()
        .post(format!("{}/query", base))
        .json(&json!({
            "query": "What does the first amendment say?",
            "chat_history": [{ "role": "user", "content": "hello" }]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    let prompt = generator.last_prompt().unwrap();
    assert!(prompt.contains("User: hello"));
    assert_eq!(body["text"], answer_for(&prompt));
    assert_eq!(body["valid"], true);
    assert_eq!(body["sources"][0]["source"], "amendments.md");
    assert_eq!(body["sources"][0]["chunk_index"], 0);
    assert_eq!(body["source_text"], body["sources"][0]["text"]);
}

#[tokio::test]
async fn test_empty_query_is_bad_request() {
    let (base, generator) = spawn_server(false).await;
    for path in ["/query", "/query/stream"] {
        let response = reqwest::Client::new()
            .post(format!("{}{}", base, path))
            .json(&json!({ "query": "  " }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["code"], "bad_request");
        assert_eq!(body["error"]["message"], "query must not be empty");
    }
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn test_stream_events() {
    let (base, generator) = spawn_server(true).await;
    let response = reqwest::Client::new()
        .post(format!("{}/query/stream", base))
        .json(&json!({ "query": "Who leads the executive branch?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let content_type = response.headers()[reqwest::header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let events = parse_sse(&response.text().await.unwrap());
    let (last_event, done) = events.last().unwrap();
    assert_eq!(last_event, "done");
    assert_eq!(done["valid"], true);
    assert_eq!(done["sources"].as_array().unwrap().len(), 1);

    let text: String = events
        .iter()
        .filter(|(event, _)| event == "fragment")
        .map(|(_, data)| data["text"].as_str().unwrap().to_string())
        .collect();
    assert!(events.len() > 2);
    assert_eq!(text, answer_for(&generator.last_prompt().unwrap()));
}

#[tokio::test]
async fn test_stream_of_fixed_answer() {
    let mut cfg = Config::default();
    cfg.guardrail.enabled = true;
    cfg.guardrail.keywords = vec!["amendment".to_string()];
    let generator = Arc::new(ScriptedGenerator::new(Behavior::Answer));
    let pipeline = common::pipeline(&cfg, Arc::new(HashEmbedder::default()), generator.clone())
        .await
        .unwrap();
    let refusal = pipeline.config().refusal.clone();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(Arc::new(pipeline))).await.unwrap();
    });

    let body = reqwest::Client::new()
        .post(format!("http://{}/query/stream", addr))
        .json(&json!({ "query": "What is the weather today?" }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let events = parse_sse(&body);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].0, "fragment");
    assert_eq!(events[0].1["text"], refusal);
    assert_eq!(events[1].1["valid"], false);
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn test_blank_stream_done_event_has_no_sources() {
    let (base, generator) = spawn_server_with(true, Behavior::Blank).await;
    let body = reqwest::Client::new()
        .post(format!("{}/query/stream", base))
        .json(&json!({ "query": "What does the first amendment say?" }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let events = parse_sse(&body);
    assert_eq!(generator.calls(), 1);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].0, "fragment");
    assert_eq!(events[0].1["text"], CANNOT_ANSWER);

    let (event, done) = &events[1];
    assert_eq!(event, "done");
    assert_eq!(done["valid"], false);
    assert!(done["sources"].as_array().unwrap().is_empty());
    assert!(done["source_text"].is_null());
}

#[tokio::test]
async fn test_blank_stream_through_query_endpoint() {
    let (base, _) = spawn_server_with(true, Behavior::Blank).await;
    let body: Value = reqwest::Client::new()
        .post(format!("{}/query", base))
        .json(&json!({ "query": "What does the first amendment say?" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["text"], CANNOT_ANSWER);
    assert_eq!(body["valid"], false);
    assert!(body["sources"].as_array().unwrap().is_empty());
}
