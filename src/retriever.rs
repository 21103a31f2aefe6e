//! Query handle over a session's index.

use std::sync::Arc;

use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::Result;
use crate::index::VectorIndex;
use crate::models::ScoredChunk;

/// Read-only handle bound to a top-k. Shares the index with other
/// retrievers; cloning is cheap.
#[derive(Clone)]
pub struct Retriever {
    session_id: String,
    index: Arc<VectorIndex>,
    provider: Arc<dyn EmbeddingProvider>,
    k: usize,
}

impl Retriever {
    pub fn new(
        session_id: impl Into<String>,
        index: Arc<VectorIndex>,
        provider: Arc<dyn EmbeddingProvider>,
        k: usize,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            index,
            provider,
            k,
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    /// Embed `text` and return the `k` most similar chunks, best first.
    pub async fn query(&self, text: &str) -> Result<Vec<ScoredChunk>> {
        let vector = embed_query(self.provider.as_ref(), text).await?;
        self.index.query(&vector, self.k)
    }
}

impl std::fmt::Debug for Retriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever")
            .field("session_id", &self.session_id)
            .field("chunks", &self.index.len())
            .field("model", &self.provider.model_name())
            .field("k", &self.k)
            .finish()
    }
}
