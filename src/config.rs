//! Configuration loading and validation.
//!
//! The pipeline is configured from a single TOML file, resolved once at
//! startup and threaded through constructors. An optional profile table
//! (`[profiles.<name>]`) is deep-merged over the base document before
//! deserialization, so per-environment values never leak into runtime
//! branching.
//!
//! ```toml
//! [retrieval]
//! top_k = 5
//!
//! [memory]
//! history_window = 6
//!
//! [prompt]
//! max_prompt_size = 12000
//!
//! [resilience]
//! retry_count = 3
//! backoff_base_ms = 500
//! circuit_breaker_threshold = 5
//!
//! [generation.model_params]
//! model_id = "gpt-4o-mini"
//! temperature = 0.5
//!
//! [profiles.prod.generation.model_params]
//! temperature = 0.3
//! ```
//!
//! Missing required keys fail fast. Unrecognized keys are ignored, except
//! inside `generation.model_params`, where they are rejected as invalid
//! parameters.

use anyhow::{bail, Context, Result};
use qa_harness_core::fallback::{FaqTopic, DEFAULT_ANSWER};
use qa_harness_core::params::GenerationParams;
use qa_harness_core::store::HistoryWindow;
use qa_harness_core::QaError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    pub retrieval: RetrievalConfig,
    pub memory: MemoryConfig,
    pub prompt: PromptConfig,
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_path")]
    pub path: PathBuf,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: default_index_path(),
        }
    }
}

fn default_index_path() -> PathBuf {
    PathBuf::from("./data/index.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    pub top_k: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    /// Maximum number of past messages given to the prompt.
    pub history_window: usize,
    /// Optional token budget; replaces the message-count bound when set.
    #[serde(default)]
    pub history_tokens: Option<usize>,
}

impl MemoryConfig {
    pub fn window(&self) -> HistoryWindow {
        match self.history_tokens {
            Some(tokens) => HistoryWindow::Tokens(tokens),
            None => HistoryWindow::Messages(self.history_window),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromptConfig {
    /// Character budget for the assembled prompt.
    pub max_prompt_size: usize,
    #[serde(default = "default_system_instructions")]
    pub system_instructions: String,
}

fn default_system_instructions() -> String {
    "You are an assistant answering questions about a reference text. \
     Answer only from the provided passages, cite them by their [n] tag, \
     and say so when the passages do not contain the answer."
        .to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResilienceConfig {
    /// Retries after the first attempt.
    pub retry_count: u32,
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_circuit_cooldown_secs")]
    pub circuit_cooldown_secs: u64,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    #[serde(default = "default_request_deadline_secs")]
    pub request_deadline_secs: u64,
}

fn default_backoff_max_ms() -> u64 {
    10_000
}
fn default_circuit_cooldown_secs() -> u64 {
    60
}
fn default_attempt_timeout_secs() -> u64 {
    30
}
fn default_request_deadline_secs() -> u64 {
    120
}

impl ResilienceConfig {
    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible gateway or Ollama host).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    /// Raw parameter table; see [`GenerationConfig::params`].
    pub model_params: toml::Value,
}

fn default_generation_provider() -> String {
    "openai".to_string()
}
fn default_generation_timeout_secs() -> u64 {
    120
}

impl GenerationConfig {
    /// Parse `model_params` into the recognized parameter set.
    pub fn params(&self) -> Result<GenerationParams, QaError> {
        let params: GenerationParams = self
            .model_params
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| QaError::InvalidParameter(e.message().to_string()))?;
        params.validate()?;
        Ok(params)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FallbackConfig {
    #[serde(default = "default_fallback_answer")]
    pub default_answer: String,
    #[serde(default)]
    pub topics: Vec<FaqTopic>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            default_answer: default_fallback_answer(),
            topics: Vec::new(),
        }
    }
}

fn default_fallback_answer() -> String {
    DEFAULT_ANSWER.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path, profile: Option<&str>) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content, profile)
        .with_context(|| format!("Invalid config file: {}", path.display()))
}

/// Parse, apply `profile`, and validate a TOML document.
pub fn parse_config(content: &str, profile: Option<&str>) -> Result<Config> {
    let mut doc: toml::Table = toml::from_str(content).context("Failed to parse config file")?;
    let profiles = doc.remove("profiles");

    if let Some(name) = profile {
        let overlay = profiles
            .as_ref()
            .and_then(|p| p.get(name))
            .and_then(|p| p.as_table())
            .with_context(|| format!("Unknown config profile: '{}'", name))?;
        merge_tables(&mut doc, overlay);
    }

    let config: Config = toml::Value::Table(doc)
        .try_into()
        .context("Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Recursively overlay `overlay` onto `base`. Tables merge; other values
/// replace.
fn merge_tables(base: &mut toml::Table, overlay: &toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.memory.history_window == 0 {
        bail!("memory.history_window must be >= 1");
    }
    if config.memory.history_tokens == Some(0) {
        bail!("memory.history_tokens must be >= 1 when set");
    }
    if config.prompt.max_prompt_size == 0 {
        bail!("prompt.max_prompt_size must be >= 1");
    }

    let r = &config.resilience;
    if r.backoff_base_ms == 0 {
        bail!("resilience.backoff_base_ms must be >= 1");
    }
    if r.backoff_max_ms < r.backoff_base_ms {
        bail!("resilience.backoff_max_ms must be >= resilience.backoff_base_ms");
    }
    if r.circuit_breaker_threshold == 0 {
        bail!("resilience.circuit_breaker_threshold must be >= 1");
    }
    if r.attempt_timeout_secs == 0 || r.request_deadline_secs == 0 {
        bail!("resilience timeouts must be >= 1 second");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    match config.generation.provider.as_str() {
        "openai" | "ollama" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be openai or ollama.",
            other
        ),
    }
    config
        .generation
        .params()
        .context("generation.model_params rejected")?;

    if config.fallback.default_answer.trim().is_empty() {
        bail!("fallback.default_answer must not be empty");
    }

    Ok(())
}
