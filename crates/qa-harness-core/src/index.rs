//! Read-only semantic index over precomputed chunk embeddings.
//!
//! The index is produced offline and loaded once at startup. Lookup is a
//! brute-force scan: every chunk is scored against the query vector with the
//! index's [`Similarity`] metric, then sorted descending.
//!
//! # Ordering
//!
//! Results are ordered by score (desc). Equal scores keep the chunks'
//! insertion order, because the sort is stable. Two calls with the same
//! query vector therefore always return the same sequence.
//!
//! # File Shape
//!
//! ```json
//! {
//!   "model": "text-embedding-3-small",
//!   "dims": 1536,
//!   "metric": "cosine",
//!   "chunks": [
//!     { "id": "c-0001", "text": "...", "embedding": [0.01, ...], "source_offset": 0 }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::embedding::Similarity;
use crate::error::QaError;
use crate::models::{Chunk, RetrievalResult};

/// Serialized form of a semantic index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFile {
    /// Embedding model the chunks were embedded with.
    pub model: String,
    /// Vector dimensionality shared by every chunk.
    pub dims: usize,
    #[serde(default)]
    pub metric: Similarity,
    pub chunks: Vec<Chunk>,
}

/// A loaded, validated index. Shared read-only between requests.
#[derive(Debug)]
pub struct SemanticIndex {
    model: String,
    dims: usize,
    metric: Similarity,
    chunks: Vec<Arc<Chunk>>,
    fingerprint: String,
}

impl SemanticIndex {
    /// Validate an [`IndexFile`] and build the in-memory index.
    ///
    /// # Errors
    ///
    /// [`QaError::IndexUnavailable`] when `dims` is zero, a chunk id repeats,
    /// or an embedding has the wrong length or non-finite values.
    pub fn from_file(file: IndexFile) -> Result<Self, QaError> {
        if file.dims == 0 {
            return Err(QaError::IndexUnavailable("index dims must be > 0".into()));
        }

        let mut seen = HashSet::with_capacity(file.chunks.len());
        for chunk in &file.chunks {
            if !seen.insert(chunk.id.as_str()) {
                return Err(QaError::IndexUnavailable(format!(
                    "duplicate chunk id '{}'",
                    chunk.id
                )));
            }
            if chunk.embedding.len() != file.dims {
                return Err(QaError::IndexUnavailable(format!(
                    "chunk '{}' has {} dims, expected {}",
                    chunk.id,
                    chunk.embedding.len(),
                    file.dims
                )));
            }
            if chunk.embedding.iter().any(|v| !v.is_finite()) {
                return Err(QaError::IndexUnavailable(format!(
                    "chunk '{}' has a non-finite embedding value",
                    chunk.id
                )));
            }
        }

        let fingerprint = fingerprint(&file.chunks);

        Ok(Self {
            model: file.model,
            dims: file.dims,
            metric: file.metric,
            chunks: file.chunks.into_iter().map(Arc::new).collect(),
            fingerprint,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn metric(&self) -> Similarity {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// SHA-256 over chunk ids and texts, hex-encoded.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Return the `k` chunks most similar to `query`, best first.
    ///
    /// Returns `min(k, len)` results. A query vector of the wrong
    /// dimensionality is a non-transient [`QaError::Embedding`].
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<RetrievalResult>, QaError> {
        if query.len() != self.dims {
            return Err(QaError::embedding(
                format!(
                    "query embedding has {} dims, index expects {}",
                    query.len(),
                    self.dims
                ),
                false,
            ));
        }
        if query.iter().any(|v| !v.is_finite()) {
            return Err(QaError::embedding(
                "query embedding contains non-finite values",
                false,
            ));
        }

        let mut scored: Vec<RetrievalResult> = self
            .chunks
            .iter()
            .map(|chunk| RetrievalResult {
                score: self.metric.score(query, &chunk.embedding),
                chunk: Arc::clone(chunk),
            })
            .collect();

        // Stable: equal scores keep insertion order.
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }
}

fn fingerprint(chunks: &[Chunk]) -> String {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(chunk.text.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Load outcome of the index. A failed load does not stop the process;
/// every retrieval reports [`QaError::IndexUnavailable`] instead.
#[derive(Debug, Clone)]
pub enum IndexHandle {
    Loaded(Arc<SemanticIndex>),
    Unavailable(String),
}

impl IndexHandle {
    pub fn get(&self) -> Result<&Arc<SemanticIndex>, QaError> {
        match self {
            IndexHandle::Loaded(index) => Ok(index),
            IndexHandle::Unavailable(reason) => Err(QaError::IndexUnavailable(reason.clone())),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, IndexHandle::Loaded(_))
    }
}

impl From<Result<SemanticIndex, QaError>> for IndexHandle {
    fn from(result: Result<SemanticIndex, QaError>) -> Self {
        match result {
            Ok(index) => IndexHandle::Loaded(Arc::new(index)),
            Err(QaError::IndexUnavailable(reason)) => IndexHandle::Unavailable(reason),
            Err(other) => IndexHandle::Unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, offset: u64, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: id.into(),
            text: format!("text of {}", id),
            embedding,
            source_offset: offset,
        }
    }

    fn index(chunks: Vec<Chunk>) -> SemanticIndex {
        SemanticIndex::from_file(IndexFile {
            model: "test".into(),
            dims: 2,
            metric: Similarity::Cosine,
            chunks,
        })
        .unwrap()
    }

    #[test]
    fn test_search_orders_by_descending_score() {
        let idx = index(vec![
            chunk("far", 0, vec![0.0, 1.0]),
            chunk("near", 10, vec![1.0, 0.0]),
            chunk("mid", 20, vec![1.0, 1.0]),
        ]);
        let hits = idx.search(&[1.0, 0.0], 3).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid", "far"]);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let idx = index(vec![
            chunk("a", 0, vec![1.0, 0.0]),
            chunk("b", 5, vec![2.0, 0.0]),
            chunk("c", 9, vec![3.0, 0.0]),
        ]);
        let hits = idx.search(&[1.0, 0.0], 2).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_k_larger_than_index_returns_all() {
        let idx = index(vec![chunk("only", 0, vec![1.0, 0.0])]);
        assert_eq!(idx.search(&[0.5, 0.5], 10).unwrap().len(), 1);
    }

    #[test]
    fn test_query_dimension_mismatch_is_structural_embedding_error() {
        let idx = index(vec![chunk("a", 0, vec![1.0, 0.0])]);
        let err = idx.search(&[1.0, 0.0, 0.0], 1).unwrap_err();
        assert!(matches!(err, QaError::Embedding { transient: false, .. }));
    }

    #[test]
    fn test_rejects_wrong_dims_and_duplicates() {
        let bad_dims = SemanticIndex::from_file(IndexFile {
            model: "m".into(),
            dims: 2,
            metric: Similarity::Cosine,
            chunks: vec![chunk("a", 0, vec![1.0])],
        });
        assert!(matches!(bad_dims, Err(QaError::IndexUnavailable(_))));

        let dup = SemanticIndex::from_file(IndexFile {
            model: "m".into(),
            dims: 2,
            metric: Similarity::Cosine,
            chunks: vec![chunk("a", 0, vec![1.0, 0.0]), chunk("a", 1, vec![0.0, 1.0])],
        });
        assert!(matches!(dup, Err(QaError::IndexUnavailable(_))));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = index(vec![chunk("a", 0, vec![1.0, 0.0])]);
        let b = index(vec![chunk("a", 0, vec![0.0, 1.0])]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_unavailable_handle_reports_reason() {
        let handle = IndexHandle::Unavailable("no such file".into());
        assert!(!handle.is_loaded());
        assert_eq!(
            handle.get().unwrap_err(),
            QaError::IndexUnavailable("no such file".into())
        );
    }
}
