//! `docchat index build|rebuild|status`.

use anyhow::Result;

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::store;

/// Load the snapshot, building it only if it is missing or unusable.
pub async fn run_index_build(config: &Config) -> Result<()> {
    let embedder = create_embedder(&config.embedding)?;
    let index = store::load_or_build(config, embedder.as_ref()).await?;

    println!("index ready");
    println!("  documents: {}", index.documents().len());
    println!("  chunks: {}", index.len());
    println!("  model: {}", index.meta().embedding_model);
    println!("  storage: {}", config.storage.dir.display());
    Ok(())
}

/// Rebuild from the corpus, replacing any snapshot.
pub async fn run_index_rebuild(config: &Config) -> Result<()> {
    let embedder = create_embedder(&config.embedding)?;
    let index = store::build(config, embedder.as_ref()).await?;

    println!("index rebuilt");
    println!("  documents: {}", index.documents().len());
    println!("  chunks: {}", index.len());
    println!("  dims: {}", index.meta().dims);
    Ok(())
}

/// Describe the snapshot on disk without loading vectors.
pub fn run_index_status(config: &Config) -> Result<()> {
    let dir = &config.storage.dir;
    match store::snapshot_status(dir) {
        Ok(Some(status)) => {
            println!("index status");
            println!("  storage: {}", dir.display());
            println!("  format version: {}", status.meta.version);
            println!("  model: {}", status.meta.embedding_model);
            println!("  dims: {}", status.meta.dims);
            println!("  documents: {}", status.documents);
            println!("  chunks: {}", status.chunks);
            println!("  created: {}", status.meta.created_at.to_rfc3339());
        }
        Ok(None) => {
            println!("index status");
            println!("  no snapshot in {} (run `docchat index build`)", dir.display());
        }
        Err(e) => {
            println!("index status");
            println!("  snapshot in {} is unusable: {}", dir.display(), e);
            println!("  it will be rebuilt on next use");
        }
    }
    Ok(())
}
