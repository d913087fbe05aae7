//! Answer validation.
//!
//! An answer is only shown to the user when it is non-blank and grounded in
//! at least one retrieved chunk. Anything else is replaced with
//! [`CANNOT_ANSWER`] (or the configured equivalent).

use std::fmt;

use crate::models::ScoredChunk;

pub const CANNOT_ANSWER: &str = "Cannot answer based on the available information.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    EmptyAnswer,
    NoSources,
    GenerationFailed(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::EmptyAnswer => write!(f, "empty answer"),
            RejectReason::NoSources => write!(f, "no source chunks"),
            RejectReason::GenerationFailed(reason) => write!(f, "generation failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Rejected(RejectReason),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid)
    }
}

/// Validate a complete answer against the sources it was generated from.
pub fn validate(text: &str, sources: &[ScoredChunk]) -> Validation {
    if let Validation::Rejected(reason) = validate_sources(sources) {
        return Validation::Rejected(reason);
    }
    if text.trim().is_empty() {
        return Validation::Rejected(RejectReason::EmptyAnswer);
    }
    Validation::Valid
}

/// The part of [`validate`] that can run before any text exists, used to
/// vet a streaming answer up front.
pub fn validate_sources(sources: &[ScoredChunk]) -> Validation {
    if sources.is_empty() {
        Validation::Rejected(RejectReason::NoSources)
    } else {
        Validation::Valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;

    fn source() -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                id: "c".into(),
                document_id: "d".into(),
                source: "d.md".into(),
                chunk_index: 0,
                text: "text".into(),
                hash: String::new(),
            },
            score: 0.9,
        }
    }

    #[test]
    fn test_grounded_answer_valid() {
        assert_eq!(validate("An answer.", &[source()]), Validation::Valid);
    }

    #[test]
    fn test_blank_answer_rejected() {
        assert_eq!(
            validate("  \n\t", &[source()]),
            Validation::Rejected(RejectReason::EmptyAnswer)
        );
    }

    #[test]
    fn test_no_sources_rejected() {
        let v = validate("An answer.", &[]);
        assert_eq!(v, Validation::Rejected(RejectReason::NoSources));
        assert!(!v.is_valid());
        assert!(!validate_sources(&[]).is_valid());
    }

    #[test]
    fn test_reason_display() {
        let r = RejectReason::GenerationFailed("timeout".into());
        assert_eq!(r.to_string(), "generation failed: timeout");
    }
}
