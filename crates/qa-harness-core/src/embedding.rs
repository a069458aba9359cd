//! Embedding provider trait and similarity functions.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement, plus the [`Similarity`] metrics the semantic index scores with.
//!
//! Concrete provider implementations (OpenAI, Ollama) live in the
//! `qa-harness` app crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::QaError;

/// Trait for embedding providers.
///
/// Providers perform a single call per invocation and do not retry
/// internally; retry and circuit-breaking belong to the caller. Failures are
/// reported as [`QaError::Embedding`] with the `transient` flag set for
/// rate limits, server errors, and network faults.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, QaError>;
}

/// Scoring function used for nearest-neighbor lookup.
///
/// Both metrics are deterministic for identical inputs, which keeps
/// retrieval stable across repeated calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Similarity {
    /// Cosine similarity in `[-1.0, 1.0]`.
    #[default]
    Cosine,
    /// Raw inner product. Equivalent to cosine for unit-normalized vectors.
    Dot,
}

impl Similarity {
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Similarity::Cosine => cosine_similarity(a, b),
            Similarity::Dot => dot_product(a, b),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Similarity::Cosine => "cosine",
            Similarity::Dot => "dot",
        }
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// Returns `0.0` for empty vectors, zero vectors, or vectors of different
/// lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Inner product of two vectors; `0.0` when lengths differ.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
