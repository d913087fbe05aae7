//! In-memory chat session.
//!
//! Holds one caller's conversation for the life of the process. The pipeline
//! never sees the session itself, only the history copied into each
//! [`QueryRequest`].

use docchat_core::models::ChatMessage;

use crate::pipeline::QueryRequest;

#[derive(Debug, Clone, Default)]
pub struct ChatSession {
    messages: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request for `query` carrying the history so far (without `query`
    /// itself).
    pub fn begin_turn(&self, query: &str) -> QueryRequest {
        QueryRequest::new(query).with_history(self.messages.clone())
    }

    /// Record a completed exchange.
    pub fn finish_turn(&mut self, query: &str, answer: &str, source: Option<String>) {
        self.messages.push(ChatMessage::user(query));
        self.messages.push(ChatMessage::assistant(answer).with_source(source));
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
