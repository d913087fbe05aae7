//! Response synthesis over retrieved chunks.
//!
//! Decides how many generation calls a query costs and what each prompt
//! contains, according to [`ResponseMode`]:
//!
//! - `compact`: as many chunks as fit the context window go into a single
//!   prompt; the rest are dropped.
//! - `tree_summarize`: chunks are packed into window-sized groups, each group
//!   is answered separately (non-streaming), and the partial answers are fed
//!   back in as context until one prompt holds everything. Only that last
//!   call streams.
//!
//! The budget for context is the context window minus the prompt scaffold
//! (template, history and query rendered with empty context) minus
//! `max_output_tokens`, all measured with
//! [`estimate_tokens`](docchat_core::chunk::estimate_tokens).

use tracing::{debug, warn};

use docchat_core::chunk::{estimate_tokens, CHARS_PER_TOKEN};
use docchat_core::models::ChatMessage;
use docchat_core::prompt::{compose, PromptTemplate};

use crate::config::{GenerationConfig, ResponseMode};
use crate::generation::{generate, Generation, Generator};

const SEPARATOR_CHARS: usize = 2;

/// Produce an answer for `query` from `chunks` (in retrieval order).
pub async fn synthesize(
    generator: &dyn Generator,
    template: &PromptTemplate,
    config: &GenerationConfig,
    query: &str,
    history: &[ChatMessage],
    chunks: &[&str],
) -> Generation {
    let budget = context_budget(template, config, history, query);
    match config.response_mode {
        ResponseMode::Compact => {
            compact(generator, template, config, query, history, chunks, budget).await
        }
        ResponseMode::TreeSummarize => {
            tree_summarize(generator, template, config, query, history, chunks, budget).await
        }
    }
}

/// Tokens available for `{context_str}`.
pub fn context_budget(
    template: &PromptTemplate,
    config: &GenerationConfig,
    history: &[ChatMessage],
    query: &str,
) -> usize {
    let scaffold = compose::<&str>(template, &[], history, query);
    let used = estimate_tokens(&scaffold) + config.max_output_tokens;
    let budget = config.context_window.saturating_sub(used);
    if budget == 0 {
        warn!(
            context_window = config.context_window,
            used, "prompt scaffold leaves no room for context"
        );
    }
    budget.max(1)
}

async fn compact(
    generator: &dyn Generator,
    template: &PromptTemplate,
    config: &GenerationConfig,
    query: &str,
    history: &[ChatMessage],
    chunks: &[&str],
    budget: usize,
) -> Generation {
    let groups = pack(chunks, budget);
    let first = groups.into_iter().next().unwrap_or_default();
    if first.len() < chunks.len() {
        debug!(
            kept = first.len(),
            retrieved = chunks.len(),
            "context window full, dropping chunks"
        );
    }
    let prompt = compose(template, &first, history, query);
    generate(generator, &prompt, config).await
}

async fn tree_summarize(
    generator: &dyn Generator,
    template: &PromptTemplate,
    config: &GenerationConfig,
    query: &str,
    history: &[ChatMessage],
    chunks: &[&str],
    budget: usize,
) -> Generation {
    let mut texts: Vec<String> = chunks.iter().map(|c| c.to_string()).collect();
    let mut first_round = true;

    loop {
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let groups = pack(&refs, budget);

        if groups.len() <= 1 {
            return compact(generator, template, config, query, history, &refs, budget).await;
        }
        if !first_round && groups.len() == texts.len() {
            debug!(
                parts = texts.len(),
                "partial answers cannot be combined further, compacting"
            );
            return compact(generator, template, config, query, history, &refs, budget).await;
        }

        debug!(groups = groups.len(), "summarizing chunk groups");
        let mut partials = Vec::with_capacity(groups.len());
        for group in &groups {
            let prompt = compose(template, group, &[], query);
            match generator.complete(&prompt, config).await {
                Ok(text) => partials.push(text),
                Err(e) => {
                    warn!(error = %e, "intermediate summary failed");
                    return Generation::Failed(e.to_string());
                }
            }
        }
        texts = partials;
        first_round = false;
    }
}

/// Greedily pack `texts` (in order) into groups whose blank-line-joined
/// length fits `budget` tokens. A text larger than the budget is cut to fit
/// and gets a group of its own.
pub fn pack<'a>(texts: &[&'a str], budget: usize) -> Vec<Vec<&'a str>> {
    let max_chars = budget.max(1) * CHARS_PER_TOKEN;
    let mut groups: Vec<Vec<&'a str>> = Vec::new();
    let mut current: Vec<&'a str> = Vec::new();
    let mut current_len = 0usize;

    for &text in texts {
        let text = truncate(text.trim(), max_chars);
        let needed = if current.is_empty() {
            text.len()
        } else {
            current_len + SEPARATOR_CHARS + text.len()
        };
        if needed > max_chars && !current.is_empty() {
            groups.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current_len = if current.is_empty() {
            text.len()
        } else {
            current_len + SEPARATOR_CHARS + text.len()
        };
        current.push(text);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

fn truncate(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        return text;
    }
    let mut end = max_chars;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
