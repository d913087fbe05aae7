//! # docchat core
//!
//! Runtime-independent logic for grounded question answering: data models,
//! chunking, the in-memory [`index::Index`], top-k retrieval, the keyword
//! guardrail, prompt composition and answer validation.
//!
//! This crate does no filesystem or network I/O. Embedding backends,
//! snapshot persistence and generation clients live in the `docchat`
//! application crate and plug in through [`embedding::Embedder`].

pub mod chunk;
pub mod embedding;
pub mod guardrail;
pub mod index;
pub mod models;
pub mod prompt;
pub mod retrieve;
pub mod validate;
