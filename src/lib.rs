//! # docchat
//!
//! Ask questions about a directory of documents. docchat chunks and embeds
//! the corpus once, persists the index, and answers each query from the
//! best-matching passages through a language model, streaming the answer
//! and citing its source.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────┐
//! │  Corpus  │──▶│ Chunk+Embed  │──▶│ Snapshot  │
//! │ md/pdf.. │   │              │   │ storage/  │
//! └──────────┘   └──────────────┘   └─────┬─────┘
//!                                         │ load once
//!                                         ▼
//!         ┌──────────────────────────────────────────────┐
//!         │ QueryPipeline: guardrail ─▶ retrieve ─▶      │
//!         │   synthesize ─▶ validate ─▶ QueryResponse    │
//!         └──────────────┬───────────────────┬───────────┘
//!                        ▼                   ▼
//!                  ┌──────────┐        ┌──────────┐
//!                  │   CLI    │        │   HTTP   │
//!                  │ ask/chat │        │  /query  │
//!                  └──────────┘        └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`corpus`] | Corpus loading |
//! | [`extract`] | PDF and DOCX text extraction |
//! | [`embedding`] | OpenAI, Ollama and local embedding providers |
//! | [`store`] | Index snapshot persistence and rebuild |
//! | [`generation`] | Generation backends and fragment streaming |
//! | [`synth`] | `compact` and `tree_summarize` response modes |
//! | [`pipeline`] | The query pipeline |
//! | [`session`] | In-memory chat session |
//! | [`server`] | HTTP API |
//!
//! Chunking, retrieval, prompt composition, the guardrail and answer
//! validation live in the `docchat-core` crate.

pub mod ask;
pub mod config;
pub mod corpus;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generation;
pub mod index_cmd;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod store;
pub mod synth;
