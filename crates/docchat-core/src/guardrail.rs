//! Keyword guardrail.
//!
//! A cheap pre-filter that keeps a deployment on topic: a query is in scope
//! when it contains at least one configured keyword, compared as a
//! case-insensitive substring. It is not a semantic classifier. "amend"
//! matches "amendment", and an on-topic question that uses none of the
//! keywords is refused.
//!
//! A guardrail with no keywords is a pass-through.

/// Result of [`Guardrail::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    InScope,
    OutOfScope,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Guardrail {
    /// Lowercased, non-empty keywords.
    keywords: Vec<String>,
}

impl Guardrail {
    /// Build a guardrail from a keyword list. Blank keywords are ignored.
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self { keywords }
    }

    /// A guardrail that lets every query through.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        !self.keywords.is_empty()
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn classify(&self, query: &str) -> Scope {
        if !self.is_enabled() {
            return Scope::InScope;
        }
        let query = query.to_lowercase();
        if self.keywords.iter().any(|k| query.contains(k.as_str())) {
            Scope::InScope
        } else {
            Scope::OutOfScope
        }
    }
}
