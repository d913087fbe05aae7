//! Typed startup errors.
//!
//! Everything that can stop `docchat` before it answers its first question
//! is a [`ConfigError`]. Runtime failures inside the query pipeline never
//! surface as errors: they become refusals (see [`crate::pipeline`]).

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("{0} environment variable not set")]
    MissingCredential(&'static str),

    #[error("corpus directory {} contains no readable documents", .0.display())]
    EmptyCorpus(PathBuf),

    #[error("corpus directory {} is unreadable: {message}", .path.display())]
    UnreadableCorpus { path: PathBuf, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid(message.into())
    }
}
