//! Deterministic degraded answers.
//!
//! When the pipeline cannot produce a generated answer, the orchestrator asks
//! a [`FallbackResponder`] for a replacement message. The built-in
//! [`KnowledgeFallback`] never calls an external service: it matches the
//! question against configured FAQ topics and wraps the result with a
//! degraded-mode notice and a line explaining why.
//!
//! Same question and same reason always produce the same text.

use serde::{Deserialize, Serialize};

use crate::error::QaError;
use crate::models::{ChunkRef, Message};

/// First line of every fallback answer.
pub const DEGRADED_NOTICE: &str =
    "[Degraded mode] This answer was not generated from the reference text.";

pub const DEFAULT_ANSWER: &str =
    "Sorry, I cannot answer your question right now. Your question has been kept in this conversation.";

/// Why the primary pipeline gave up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackReason {
    /// The circuit breaker rejected the call.
    CircuitOpen { retry_in_secs: u64 },
    /// Every allowed attempt failed with a transient fault.
    RetriesExhausted { attempts: u32, last_error: String },
    /// The overall request deadline passed.
    DeadlineExceeded,
    /// A non-retryable fault such as a missing index.
    Unavailable { detail: String },
    /// The answer stream broke after it started.
    StreamInterrupted { detail: String },
}

impl FallbackReason {
    fn explanation(&self) -> String {
        match self {
            FallbackReason::CircuitOpen { retry_in_secs } => {
                let secs = (*retry_in_secs).max(1);
                format!(
                    "The answer service is paused after repeated failures. Please retry in about {} {}.",
                    secs,
                    if secs == 1 { "second" } else { "seconds" }
                )
            }
            FallbackReason::RetriesExhausted { attempts, .. } => format!(
                "The answer service did not respond after {} attempts. Please try again shortly.",
                attempts
            ),
            FallbackReason::DeadlineExceeded => {
                "The request took too long to complete. Please try again.".to_string()
            }
            FallbackReason::Unavailable { .. } => {
                "The reference index or answer service is not available right now.".to_string()
            }
            FallbackReason::StreamInterrupted { .. } => {
                "The answer was interrupted before it finished. Please ask again.".to_string()
            }
        }
    }
}

pub struct FallbackContext<'a> {
    pub question: &'a str,
    pub reason: &'a FallbackReason,
    /// Chunks retrieved before the failure, if retrieval succeeded.
    pub retrieved: &'a [ChunkRef],
}

pub trait FallbackResponder: Send + Sync {
    /// Build a complete assistant message. An error here ends the request.
    fn respond(&self, ctx: &FallbackContext<'_>) -> Result<Message, QaError>;
}

/// A canned answer selected by keyword.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaqTopic {
    pub keywords: Vec<String>,
    pub answer: String,
}

struct NormalizedTopic {
    keywords: Vec<String>,
    answer: String,
}

pub struct KnowledgeFallback {
    topics: Vec<NormalizedTopic>,
    default_answer: String,
}

impl KnowledgeFallback {
    pub fn new(topics: Vec<FaqTopic>, default_answer: impl Into<String>) -> Self {
        let topics = topics
            .into_iter()
            .map(|t| NormalizedTopic {
                keywords: t
                    .keywords
                    .iter()
                    .map(|k| fold(k.trim()))
                    .filter(|k| !k.is_empty())
                    .collect(),
                answer: t.answer.trim().to_string(),
            })
            .collect();
        Self {
            topics,
            default_answer: default_answer.into(),
        }
    }

    /// First topic, in configuration order, with a keyword in `question`.
    pub fn match_topic(&self, question: &str) -> Option<&str> {
        let folded = fold(question);
        self.topics
            .iter()
            .find(|t| t.keywords.iter().any(|k| folded.contains(k.as_str())))
            .map(|t| t.answer.as_str())
    }

    pub fn render(&self, question: &str, reason: &FallbackReason) -> String {
        let body = self
            .match_topic(question)
            .unwrap_or(self.default_answer.as_str());
        format!("{}\n\n{}\n\n{}", DEGRADED_NOTICE, body, reason.explanation())
    }
}

impl Default for KnowledgeFallback {
    fn default() -> Self {
        Self::new(Vec::new(), DEFAULT_ANSWER)
    }
}

impl FallbackResponder for KnowledgeFallback {
    fn respond(&self, ctx: &FallbackContext<'_>) -> Result<Message, QaError> {
        Ok(Message::assistant(
            self.render(ctx.question, ctx.reason),
            Vec::new(),
        ))
    }
}

/// Lowercase and strip common Latin diacritics.
fn fold(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars().flat_map(char::to_lowercase) {
        match c {
            'à' | 'á' | 'â' | 'ä' | 'ã' | 'å' => out.push('a'),
            'ç' => out.push('c'),
            'è' | 'é' | 'ê' | 'ë' => out.push('e'),
            'ì' | 'í' | 'î' | 'ï' => out.push('i'),
            'ñ' => out.push('n'),
            'ò' | 'ó' | 'ô' | 'ö' | 'õ' => out.push('o'),
            'ù' | 'ú' | 'û' | 'ü' => out.push('u'),
            'ý' | 'ÿ' => out.push('y'),
            'œ' => out.push_str("oe"),
            'æ' => out.push_str("ae"),
            '’' => out.push('\''),
            other => out.push(other),
        }
    }
    out
}
