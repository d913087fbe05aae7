//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Status, version and indexed chunk count |
//! | `POST` | `/query` | Answer a query, returning the full text |
//! | `POST` | `/query/stream` | Answer a query as server-sent events |
//!
//! Both query endpoints take:
//!
//! ```json
//! { "query": "What does the 1st amendment say?",
//!   "chat_history": [{ "role": "user", "content": "..." }] }
//! ```
//!
//! `/query/stream` sends one `fragment` event per answer fragment
//! (`{"text": "..."}`) followed by a single `done` event with the sources
//! and validity flag. An answer stream that ends blank is completed with the
//! "cannot answer" message and its `done` event carries no sources.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use docchat_core::models::ScoredChunk;

use crate::config::Config;
use crate::generation::FragmentStream;
use crate::pipeline::{QueryPipeline, QueryRequest, QueryResponse};

#[derive(Clone)]
struct AppState {
    pipeline: Arc<QueryPipeline>,
}

/// Build the pipeline from `config` and serve on `[server].bind` until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = Arc::new(QueryPipeline::from_config(config).await?);
    let bind_addr = config.server.bind.clone();

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "server listening");
    println!("docchat listening on http://{}", bind_addr);

    axum::serve(listener, router(pipeline)).await?;
    Ok(())
}

/// Routes over an existing pipeline.
pub fn router(pipeline: Arc<QueryPipeline>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/query", post(handle_query))
        .route("/query/stream", post(handle_query_stream))
        .layer(cors)
        .with_state(AppState { pipeline })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn check_query(request: &QueryRequest) -> Result<(), AppError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    Ok(())
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    chunks: usize,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        chunks: state.pipeline.index().len(),
    })
}

// ============ POST /query ============

/// A source chunk as returned to clients.
#[derive(Serialize)]
struct SourceView {
    source: String,
    chunk_index: i64,
    score: f32,
    text: String,
}

impl From<&ScoredChunk> for SourceView {
    fn from(scored: &ScoredChunk) -> Self {
        Self {
            source: scored.chunk.source.clone(),
            chunk_index: scored.chunk.chunk_index,
            score: scored.score,
            text: scored.chunk.text.clone(),
        }
    }
}

#[derive(Serialize)]
struct QueryResult {
    text: String,
    source_text: Option<String>,
    sources: Vec<SourceView>,
    valid: bool,
}

/// Everything in a [`QueryResponse`] except the answer text.
#[derive(Serialize)]
struct Attribution {
    source_text: Option<String>,
    sources: Vec<SourceView>,
    valid: bool,
}

impl Attribution {
    fn of(response: &QueryResponse) -> Self {
        Self {
            source_text: response.source_text().map(str::to_string),
            sources: response.sources.iter().map(SourceView::from).collect(),
            valid: response.valid,
        }
    }
}

async fn handle_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResult>, AppError> {
    check_query(&request)?;

    let response = state.pipeline.query(request).await.finish().await;
    let attribution = Attribution::of(&response);

    Ok(Json(QueryResult {
        text: response.text,
        source_text: attribution.source_text,
        sources: attribution.sources,
        valid: attribution.valid,
    }))
}

// ============ POST /query/stream ============

#[derive(Serialize)]
struct FragmentEvent {
    text: String,
}

async fn handle_query_stream(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Response, AppError> {
    check_query(&request)?;

    let mut response = state.pipeline.query(request).await;

    let fragments: FragmentStream = match response.take_fragments() {
        Some(fragments) => fragments,
        None => Box::pin(stream::once(std::future::ready(response.text.clone()))),
    };

    // Attribution is read after the last fragment so a stream that ended
    // blank reports no sources.
    let events = fragments
        .map(|text| Event::default().event("fragment").json_data(FragmentEvent { text }))
        .chain(stream::once(async move {
            response.settle();
            Event::default()
                .event("done")
                .json_data(Attribution::of(&response))
        }));

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}
