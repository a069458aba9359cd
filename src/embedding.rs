//! Embedding provider implementations.
//!
//! Concrete [`EmbeddingProvider`]s for the question embedding step:
//! - **[`DisabledProvider`]**: always fails; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//!
//! # Provider Selection
//!
//! Use [`create_provider`] to instantiate the appropriate provider based
//! on the configuration:
//!
//! ```rust,no_run
//! # use qa_harness::config::EmbeddingConfig;
//! # use qa_harness::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "disabled");
//! ```
//!
//! # Error Classification
//!
//! Providers make exactly one HTTP call per embedding; retries belong to the
//! resilience layer. Failures map to [`QaError::Embedding`]:
//! - HTTP 429 (rate limited) and 5xx (server error) → transient
//! - HTTP 4xx (client error, not 429) → not transient
//! - Network errors → transient

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use qa_harness_core::embedding::EmbeddingProvider;
use qa_harness_core::QaError;
use reqwest::StatusCode;

use crate::config::EmbeddingConfig;

/// Create an embedding provider from configuration.
///
/// # Errors
///
/// Returns an error for unknown provider names, missing model/dims, or a
/// missing `OPENAI_API_KEY` when the OpenAI provider is selected.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Map a non-success HTTP status to an embedding fault.
fn classify_status(service: &str, status: StatusCode, body: &str) -> QaError {
    let transient = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
    QaError::embedding(format!("{} API error {}: {}", service, status, body), transient)
}

fn client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Check the provider returned a vector of the configured size.
fn check_dims(vector: Vec<f32>, dims: usize) -> Result<Vec<f32>, QaError> {
    if vector.len() != dims {
        return Err(QaError::embedding(
            format!("provider returned {} dims, expected {}", vector.len(), dims),
            false,
        ));
    }
    Ok(vector)
}

// ============ Disabled Provider ============

/// A no-op provider that always fails with a non-transient fault.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, QaError> {
        Err(QaError::embedding("embedding provider is disabled", false))
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API (or a compatible gateway).
///
/// Requires `OPENAI_API_KEY` in the environment.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            model,
            dims,
            url,
            api_key,
            client: client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, QaError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| QaError::embedding(format!("OpenAI request failed: {}", e), true))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_status("OpenAI", status, &body_text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| QaError::embedding(format!("OpenAI response unreadable: {}", e), true))?;
        check_dims(parse_openai_response(&json)?, self.dims)
    }
}

/// Extract `data[0].embedding` from an OpenAI embeddings response.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<f32>, QaError> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            QaError::embedding("Invalid OpenAI response: missing data[0].embedding", false)
        })?;
    Ok(to_vector(embedding))
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured Ollama URL (default: `http://localhost:11434`).
/// Requires Ollama to be running with an embedding model pulled (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            dims,
            url,
            client: client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, QaError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                QaError::embedding(
                    format!(
                        "Ollama connection error (is Ollama running at {}?): {}",
                        self.url, e
                    ),
                    true,
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_status("Ollama", status, &body_text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| QaError::embedding(format!("Ollama response unreadable: {}", e), true))?;
        check_dims(parse_ollama_response(&json)?, self.dims)
    }
}

/// Extract `embeddings[0]` from an Ollama `/api/embed` response.
fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<f32>, QaError> {
    let embedding = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .and_then(|e| e.first())
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            QaError::embedding("Invalid Ollama response: missing embeddings[0]", false)
        })?;
    Ok(to_vector(embedding))
}

fn to_vector(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_classification() {
        assert!(classify_status("OpenAI", StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status("OpenAI", StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!classify_status("OpenAI", StatusCode::UNAUTHORIZED, "").is_transient());
    }

    #[test]
    fn test_parse_openai_response() {
        let json = json!({ "data": [ { "index": 0, "embedding": [0.5, -0.25] } ] });
        assert_eq!(parse_openai_response(&json).unwrap(), vec![0.5, -0.25]);
        assert!(parse_openai_response(&json!({ "data": [] })).is_err());
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = json!({ "model": "nomic", "embeddings": [[1.0, 2.0, 3.0]] });
        assert_eq!(parse_ollama_response(&json).unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_dims_mismatch_is_not_transient() {
        let err = check_dims(vec![1.0], 3).unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_disabled_provider_fails_structurally() {
        let provider = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.model_name(), "disabled");
        let err = provider.embed("q").await.unwrap_err();
        assert!(matches!(err, QaError::Embedding { transient: false, .. }));
    }
}
