//! Vector store access: the trait the pipeline retrieves against, and the
//! Qdrant REST implementation.

pub mod qdrant;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, ChunkId, SparseVector};

/// A point returned by a scored query.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Read-side operations the pipeline needs from the vector store.
///
/// Queries against a collection that does not exist return an empty list
/// rather than an error, so a partially provisioned store still answers.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Hybrid dense+sparse query with server-side rank fusion in one
    /// collection. `sparse` is omitted from the request when `None`.
    async fn hybrid_query(
        &self,
        collection: &str,
        dense: &[f32],
        sparse: Option<&SparseVector>,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>>;

    /// Hybrid query against the primary collection, optionally narrowed to
    /// laws whose name matches `law_keyword`.
    async fn article_query(
        &self,
        dense: &[f32],
        sparse: Option<&SparseVector>,
        law_keyword: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>>;

    /// Fetch chunks by ID from the primary collection. Unknown IDs are
    /// silently absent from the result.
    async fn retrieve(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>>;

    /// Metadata scroll in the primary collection for an article heading
    /// within a law.
    async fn scroll_article(
        &self,
        article_base: &str,
        law_words: &str,
        limit: usize,
    ) -> Result<Vec<Chunk>>;
}
