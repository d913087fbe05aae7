//! Prompt composition.
//!
//! A [`PromptTemplate`] is plain text with three placeholders:
//!
//! | Placeholder | Replaced with |
//! |-------------|---------------|
//! | `{context_str}` | retrieved chunk texts, in retrieval order, blank-line separated |
//! | `{query_str}` | the user's question |
//! | `{chat_history}` | optional; the history window as `User: …` / `Assistant: …` lines |
//!
//! Substitution is a single left-to-right pass over the template, so
//! placeholder-like text inside chunks, history or the query is copied
//! verbatim and never expanded.

use anyhow::{bail, Result};

use crate::models::ChatMessage;

pub const CONTEXT_PLACEHOLDER: &str = "{context_str}";
pub const QUERY_PLACEHOLDER: &str = "{query_str}";
pub const HISTORY_PLACEHOLDER: &str = "{chat_history}";

/// Default question-answering template.
pub const DEFAULT_TEMPLATE: &str = "\
You are a helpful assistant that answers questions based on the provided documents. \
Only answer questions that can be answered using the provided document content. \
Do not mention the documents in your response. \
If a question cannot be answered using the documents, politely explain that you can only \
answer questions related to my knowledge base.

Conversation so far:
{chat_history}

Context information is below:
---------------------
{context_str}
---------------------
Given this context, please answer the question: {query_str}
";

/// A validated prompt template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    text: String,
}

impl PromptTemplate {
    /// Fails if `{context_str}` or `{query_str}` is missing.
    pub fn new(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        for placeholder in [CONTEXT_PLACEHOLDER, QUERY_PLACEHOLDER] {
            if !text.contains(placeholder) {
                bail!("prompt template is missing the {} placeholder", placeholder);
            }
        }
        Ok(Self { text })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn has_history(&self) -> bool {
        self.text.contains(HISTORY_PLACEHOLDER)
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            text: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

/// Fill `template` with context, history and query.
///
/// An empty `context` yields an empty `{context_str}`.
pub fn compose<S: AsRef<str>>(
    template: &PromptTemplate,
    context: &[S],
    history: &[ChatMessage],
    query: &str,
) -> String {
    let context = render_context(context);
    let history = render_history(history);
    substitute(
        &template.text,
        &[
            (CONTEXT_PLACEHOLDER, context.as_str()),
            (QUERY_PLACEHOLDER, query),
            (HISTORY_PLACEHOLDER, history.as_str()),
        ],
    )
}

/// Join chunk texts with a blank line.
pub fn render_context<S: AsRef<str>>(context: &[S]) -> String {
    context
        .iter()
        .map(|c| c.as_ref().trim())
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn render_history(history: &[ChatMessage]) -> String {
    history
        .iter()
        .map(|m| format!("{}: {}", m.role.label(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The last `n` messages of `history`, in their original order.
pub fn window(history: &[ChatMessage], n: usize) -> &[ChatMessage] {
    &history[history.len().saturating_sub(n)..]
}

fn substitute(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len() + values.iter().map(|(_, v)| v.len()).sum::<usize>());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        match values.iter().find(|(key, _)| tail.starts_with(key)) {
            Some((key, value)) => {
                out.push_str(value);
                rest = &tail[key.len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
