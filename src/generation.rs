//! Generation clients with streaming output.
//!
//! A [`GenerationClient`] turns an [`AssembledPrompt`] into a
//! [`TokenStream`]: a finite, non-restartable stream of text fragments in
//! generation order. Dropping the stream drops the underlying HTTP response,
//! which releases the connection; no further fragments are produced.
//!
//! | Provider | Endpoint | Wire format |
//! |----------|----------|-------------|
//! | `openai` | `POST {url}/chat/completions` | SSE `data:` lines, `[DONE]` terminator |
//! | `ollama` | `POST {url}/api/chat` | NDJSON, `"done": true` terminator |
//!
//! # Error Classification
//!
//! | Cause | Fault |
//! |-------|-------|
//! | HTTP 429 | `RateLimited` |
//! | HTTP 408 / 504, client timeout | `GenerationTimeout` |
//! | other 5xx, network error | transient `Service` |
//! | HTTP 400 / 422 | `InvalidParameter` |
//! | other 4xx | non-transient `Service` |

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use qa_harness_core::params::GenerationParams;
use qa_harness_core::prompt::AssembledPrompt;
use qa_harness_core::QaError;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;

use crate::config::GenerationConfig;

/// Incremental text fragments, or the fault that ended the stream.
pub type TokenStream = BoxStream<'static, Result<String, QaError>>;

#[async_trait]
pub trait GenerationClient: Send + Sync {
    fn name(&self) -> &str;

    /// Start a streaming generation.
    async fn generate(
        &self,
        prompt: &AssembledPrompt,
        params: &GenerationParams,
    ) -> Result<TokenStream, QaError>;

    /// Generate and collect the whole completion.
    async fn generate_sync(
        &self,
        prompt: &AssembledPrompt,
        params: &GenerationParams,
    ) -> Result<String, QaError> {
        let mut tokens = self.generate(prompt, params).await?;
        let mut text = String::new();
        while let Some(token) = tokens.next().await {
            text.push_str(&token?);
        }
        Ok(text)
    }
}

pub fn create_client(config: &GenerationConfig) -> Result<Arc<dyn GenerationClient>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIClient::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaClient::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

fn classify_status(service: &str, status: StatusCode, body: &str) -> QaError {
    let message = format!("{} API error {}: {}", service, status, body);
    match status {
        StatusCode::TOO_MANY_REQUESTS => QaError::RateLimited(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            QaError::GenerationTimeout(message)
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            QaError::InvalidParameter(message)
        }
        s if s.is_server_error() => QaError::service(message, true),
        _ => QaError::service(message, false),
    }
}

fn classify_transport(service: &str, err: reqwest::Error) -> QaError {
    if err.is_timeout() {
        QaError::GenerationTimeout(format!("{} request timed out: {}", service, err))
    } else {
        QaError::service(format!("{} connection error: {}", service, err), true)
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

fn chat_messages(prompt: &AssembledPrompt) -> Vec<ChatMessage<'_>> {
    prompt
        .messages
        .iter()
        .map(|m| ChatMessage {
            role: m.role.as_str(),
            content: &m.content,
        })
        .collect()
}

async fn open_stream(
    service: &'static str,
    request: reqwest::RequestBuilder,
    parse: fn(&str) -> Result<LineEvent, QaError>,
) -> Result<TokenStream, QaError> {
    let response = request
        .send()
        .await
        .map_err(|e| classify_transport(service, e))?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(classify_status(service, status, &body_text));
    }

    let bytes = response
        .bytes_stream()
        .map(move |chunk| chunk.map_err(|e| classify_transport(service, e)))
        .boxed();
    Ok(line_stream(bytes, parse))
}

// ============ Line decoding ============

/// What one wire line contributes to the token stream.
#[derive(Debug, Default, PartialEq)]
struct LineEvent {
    token: Option<String>,
    done: bool,
}

struct LineState<B> {
    bytes: BoxStream<'static, Result<B, QaError>>,
    buf: Vec<u8>,
    pending: VecDeque<Result<String, QaError>>,
    finished: bool,
}

impl<B> LineState<B> {
    /// Parse one complete line; stops the stream on a terminator or fault.
    fn accept(&mut self, raw: &[u8], parse: fn(&str) -> Result<LineEvent, QaError>) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match parse(line) {
            Ok(event) => {
                if let Some(token) = event.token.filter(|t| !t.is_empty()) {
                    self.pending.push_back(Ok(token));
                }
                if event.done {
                    self.finished = true;
                }
            }
            Err(e) => {
                self.pending.push_back(Err(e));
                self.finished = true;
            }
        }
    }
}

/// Reassemble byte chunks into lines and parse each one. A line split
/// across network reads is held until its newline arrives.
fn line_stream<B>(
    bytes: BoxStream<'static, Result<B, QaError>>,
    parse: fn(&str) -> Result<LineEvent, QaError>,
) -> TokenStream
where
    B: AsRef<[u8]> + Send + 'static,
{
    let state = LineState {
        bytes,
        buf: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, move |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    st.buf.extend_from_slice(chunk.as_ref());
                    while !st.finished {
                        let Some(pos) = st.buf.iter().position(|b| *b == b'\n') else {
                            break;
                        };
                        let line: Vec<u8> = st.buf.drain(..=pos).collect();
                        st.accept(&line, parse);
                    }
                }
                Some(Err(e)) => {
                    st.pending.push_back(Err(e));
                    st.finished = true;
                }
                None => {
                    let rest = std::mem::take(&mut st.buf);
                    st.accept(&rest, parse);
                    st.finished = true;
                }
            }
        }
    })
    .boxed()
}

fn error_message(json: &Value) -> Option<String> {
    match json.get("error")? {
        Value::String(s) => Some(s.clone()),
        other => Some(
            other
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        ),
    }
}

// ============ OpenAI Client ============

/// Chat-completions client for OpenAI or any compatible endpoint.
///
/// Requires `OPENAI_API_KEY` in the environment.
pub struct OpenAIClient {
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
    stream: bool,
}

#[async_trait]
impl GenerationClient for OpenAIClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(
        &self,
        prompt: &AssembledPrompt,
        params: &GenerationParams,
    ) -> Result<TokenStream, QaError> {
        params.validate()?;
        let body = OpenAIRequest {
            model: &params.model_id,
            messages: chat_messages(prompt),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            top_p: params.top_p,
            stop: &params.stop,
            stream: true,
        };
        let request = self
            .client
            .post(format!("{}/chat/completions", self.url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body);
        open_stream("OpenAI", request, parse_openai_line).await
    }
}

/// Parse one SSE line of a streamed chat completion.
fn parse_openai_line(line: &str) -> Result<LineEvent, QaError> {
    let Some(data) = line.strip_prefix("data:") else {
        // `event:`, `id:` and `:` comment lines carry no text
        return Ok(LineEvent::default());
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(LineEvent {
            token: None,
            done: true,
        });
    }

    let json: Value = serde_json::from_str(data)
        .map_err(|e| QaError::service(format!("malformed OpenAI stream event: {}", e), true))?;
    if let Some(message) = error_message(&json) {
        return Err(QaError::service(message, true));
    }

    let token = json
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
        .map(str::to_string);
    Ok(LineEvent { token, done: false })
}

// ============ Ollama Client ============

/// Chat client for a local Ollama instance (`/api/chat`).
pub struct OllamaClient {
    url: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        Ok(Self {
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[derive(Serialize)]
struct OllamaOptions<'a> {
    temperature: f32,
    num_predict: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: OllamaOptions<'a>,
}

#[async_trait]
impl GenerationClient for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(
        &self,
        prompt: &AssembledPrompt,
        params: &GenerationParams,
    ) -> Result<TokenStream, QaError> {
        params.validate()?;
        let body = OllamaRequest {
            model: &params.model_id,
            messages: chat_messages(prompt),
            stream: true,
            options: OllamaOptions {
                temperature: params.temperature,
                num_predict: params.max_tokens,
                top_p: params.top_p,
                stop: &params.stop,
            },
        };
        let request = self
            .client
            .post(format!("{}/api/chat", self.url.trim_end_matches('/')))
            .json(&body);
        open_stream("Ollama", request, parse_ollama_line).await
    }
}

/// Parse one NDJSON line of a streamed Ollama chat.
fn parse_ollama_line(line: &str) -> Result<LineEvent, QaError> {
    let json: Value = serde_json::from_str(line)
        .map_err(|e| QaError::service(format!("malformed Ollama stream line: {}", e), true))?;
    if let Some(message) = error_message(&json) {
        return Err(QaError::service(message, true));
    }
    Ok(LineEvent {
        token: json
            .pointer("/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string),
        done: json.get("done").and_then(|d| d.as_bool()).unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use qa_harness_core::prompt::PromptAssembler;

    fn chunks(parts: &[&str]) -> BoxStream<'static, Result<Vec<u8>, QaError>> {
        let items: Vec<Result<Vec<u8>, QaError>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        stream::iter(items).boxed()
    }

    async fn collect(tokens: TokenStream) -> Vec<Result<String, QaError>> {
        tokens.collect().await
    }

    #[tokio::test]
    async fn test_openai_lines_split_across_reads() {
        let bytes = chunks(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Emo\"}}]}\n\ndata: {\"choi",
            "ces\":[{\"delta\":{\"content\":\"tivity\"}}]}\n\n",
            "data: [DONE]\n\n",
        ]);
        let tokens = collect(line_stream(bytes, parse_openai_line)).await;
        let text: Vec<String> = tokens.into_iter().map(|t| t.unwrap()).collect();
        assert_eq!(text, vec!["Emo", "tivity"]);
    }

    #[tokio::test]
    async fn test_nothing_after_done() {
        let bytes = chunks(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\ndata: [DONE]\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n",
        ]);
        let tokens = collect(line_stream(bytes, parse_openai_line)).await;
        assert_eq!(tokens.len(), 1);
    }

    #[tokio::test]
    async fn test_ollama_final_line_without_newline() {
        let bytes = chunks(&[
            "{\"message\":{\"content\":\"Hello\"},\"done\":false}\n",
            "{\"message\":{\"content\":\" world\"},\"done\":true}",
        ]);
        let tokens = collect(line_stream(bytes, parse_ollama_line)).await;
        let text: String = tokens.into_iter().map(|t| t.unwrap()).collect();
        assert_eq!(text, "Hello world");
    }

    #[tokio::test]
    async fn test_transport_error_ends_stream() {
        let items: Vec<Result<Vec<u8>, QaError>> = vec![
            Ok(b"{\"message\":{\"content\":\"part\"},\"done\":false}\n".to_vec()),
            Err(QaError::service("connection reset", true)),
            Ok(b"{\"message\":{\"content\":\"never\"},\"done\":false}\n".to_vec()),
        ];
        let tokens = collect(line_stream(stream::iter(items).boxed(), parse_ollama_line)).await;
        assert_eq!(tokens.len(), 2);
        assert!(tokens[0].is_ok());
        assert!(tokens[1].as_ref().unwrap_err().is_transient());
    }

    #[test]
    fn test_stream_error_event_is_a_fault() {
        let err = parse_openai_line("data: {\"error\":{\"message\":\"overloaded\"}}").unwrap_err();
        assert!(err.to_string().contains("overloaded"));
        assert_eq!(parse_openai_line(": keep-alive").unwrap(), LineEvent::default());
    }

    #[tokio::test]
    async fn test_out_of_range_params_rejected_before_request() {
        let client = OllamaClient::new(&GenerationConfig {
            provider: "ollama".into(),
            url: Some("http://127.0.0.1:9".into()),
            timeout_secs: 5,
            model_params: toml::Value::Table(Default::default()),
        })
        .unwrap();
        let prompt = PromptAssembler::new("Answer.", 1_000).assemble("q", &[], &[]);
        let params = GenerationParams {
            model_id: "llama3".into(),
            temperature: 3.5,
            max_tokens: 10,
            top_p: None,
            stop: Vec::new(),
        };
        match client.generate(&prompt, &params).await {
            Err(QaError::InvalidParameter(msg)) => assert!(msg.contains("temperature")),
            Err(other) => panic!("unexpected fault: {}", other),
            Ok(_) => panic!("out-of-range temperature accepted"),
        }
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            classify_status("x", StatusCode::TOO_MANY_REQUESTS, ""),
            QaError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status("x", StatusCode::GATEWAY_TIMEOUT, ""),
            QaError::GenerationTimeout(_)
        ));
        assert!(classify_status("x", StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(matches!(
            classify_status("x", StatusCode::BAD_REQUEST, ""),
            QaError::InvalidParameter(_)
        ));
        assert!(!classify_status("x", StatusCode::FORBIDDEN, "").is_transient());
    }
}
