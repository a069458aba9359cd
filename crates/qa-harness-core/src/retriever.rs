//! Question → ranked chunks.
//!
//! [`Retriever::retrieve`] embeds the question through an
//! [`EmbeddingProvider`] and runs a nearest-neighbor lookup against the
//! [`SemanticIndex`](crate::index::SemanticIndex). It has no side effects.
//!
//! Failure modes:
//! - [`QaError::IndexUnavailable`]: the index failed to load. Checked before
//!   the embedding call so no external request is wasted.
//! - [`QaError::Embedding`]: the provider failed. Transient failures are left
//!   to the caller's retry policy.

use std::sync::Arc;

use tracing::debug;

use crate::embedding::EmbeddingProvider;
use crate::error::QaError;
use crate::index::IndexHandle;
use crate::models::RetrievalResult;

pub struct Retriever {
    index: IndexHandle,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl Retriever {
    pub fn new(index: IndexHandle, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { index, embedder }
    }

    pub fn index(&self) -> &IndexHandle {
        &self.index
    }

    /// Return at most `k` results sorted by descending score.
    pub async fn retrieve(&self, question: &str, k: usize) -> Result<Vec<RetrievalResult>, QaError> {
        if k == 0 {
            return Err(QaError::InvalidParameter("k must be >= 1".into()));
        }
        let index = self.index.get()?;

        let query_vec = self.embedder.embed(question).await?;
        let results = index.search(&query_vec, k)?;

        debug!(
            k,
            returned = results.len(),
            top_score = results.first().map(|r| r.score),
            "retrieval complete"
        );
        Ok(results)
    }
}
