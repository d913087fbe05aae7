//! Corpus loader.
//!
//! Walks `corpus.dir`, keeps the files matched by `include_globs` and not
//! matched by `exclude_globs` (VCS and build folders are always excluded),
//! and turns each one into a [`Document`]. Markdown and plain text are read
//! as UTF-8 (lossily); PDF and DOCX go through [`crate::extract`].
//!
//! Documents are returned sorted by their corpus-relative path, so the same
//! directory always yields the same document order and therefore the same
//! chunk ids.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use docchat_core::models::Document;

use crate::config::CorpusConfig;
use crate::error::ConfigError;
use crate::extract::{self, MIME_DOCX, MIME_PDF};

/// Load every document in the corpus.
///
/// Creates the corpus directory if it does not exist. Fails with
/// [`ConfigError::EmptyCorpus`] when no readable, non-blank document is
/// found, and [`ConfigError::UnreadableCorpus`] when the directory cannot be
/// walked.
pub fn load_documents(config: &CorpusConfig) -> Result<Vec<Document>> {
    let root = &config.dir;
    std::fs::create_dir_all(root).map_err(|e| ConfigError::UnreadableCorpus {
        path: root.clone(),
        message: e.to_string(),
    })?;

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut documents = Vec::new();

    let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = entry.map_err(|e| ConfigError::UnreadableCorpus {
            path: root.clone(),
            message: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        match read_document(path, &rel_str) {
            Ok(Some(doc)) => documents.push(doc),
            Ok(None) => debug!(source = %rel_str, "skipping blank document"),
            Err(e) => warn!(source = %rel_str, error = %e, "skipping unreadable document"),
        }
    }

    if documents.is_empty() {
        return Err(ConfigError::EmptyCorpus(root.clone()).into());
    }

    documents.sort_by(|a, b| a.source.cmp(&b.source));
    Ok(documents)
}

/// Content type used for a corpus file, from its extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "md" | "markdown" => "text/markdown",
        "pdf" => MIME_PDF,
        "docx" => MIME_DOCX,
        _ => "text/plain",
    }
}

/// `Ok(None)` for files with no text.
fn read_document(path: &Path, relative_path: &str) -> Result<Option<Document>> {
    let bytes = std::fs::read(path)?;
    let content_type = content_type_for(path);

    let body = match content_type {
        MIME_PDF | MIME_DOCX => extract::extract_text(&bytes, content_type)?,
        _ => String::from_utf8_lossy(&bytes).into_owned(),
    };
    let body = normalize(&body);

    if body.is_empty() {
        return Ok(None);
    }
    Ok(Some(Document::new(relative_path, content_type, body)))
}

/// CRLF to LF, trailing whitespace trimmed.
fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| ConfigError::invalid(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}
