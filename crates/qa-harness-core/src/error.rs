//! Fault taxonomy shared by every pipeline component.
//!
//! Each [`QaError`] belongs to exactly one [`FaultClass`], which decides how
//! the orchestrator reacts:
//!
//! | Class | Variants | Handling |
//! |-------|----------|----------|
//! | `Input` | `InvalidParameter`, `ConversationNotFound` | surfaced immediately, never retried |
//! | `Transient` | `RateLimited`, `GenerationTimeout`, transient `Embedding` / `Service` | retried, then fallback |
//! | `Structural` | `IndexUnavailable`, persistent `Embedding` / `Service` | straight to fallback |
//! | `Fatal` | `FallbackFailed` | request ends as errored |

use thiserror::Error;

/// How the orchestrator treats a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    Input,
    Transient,
    Structural,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QaError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("semantic index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("embedding failed: {message}")]
    Embedding { message: String, transient: bool },

    #[error("generation timed out: {0}")]
    GenerationTimeout(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("service error: {message}")]
    Service { message: String, transient: bool },

    #[error("{0}")]
    FallbackFailed(String),
}

impl QaError {
    pub fn class(&self) -> FaultClass {
        match self {
            QaError::InvalidParameter(_) | QaError::ConversationNotFound(_) => FaultClass::Input,
            QaError::RateLimited(_) | QaError::GenerationTimeout(_) => FaultClass::Transient,
            QaError::Embedding { transient, .. } | QaError::Service { transient, .. } => {
                if *transient {
                    FaultClass::Transient
                } else {
                    FaultClass::Structural
                }
            }
            QaError::IndexUnavailable(_) => FaultClass::Structural,
            QaError::FallbackFailed(_) => FaultClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FaultClass::Transient
    }

    /// Machine-readable code used in HTTP error bodies and NDJSON events.
    pub fn code(&self) -> &'static str {
        match self {
            QaError::InvalidParameter(_) => "invalid_parameter",
            QaError::ConversationNotFound(_) => "conversation_not_found",
            QaError::IndexUnavailable(_) => "index_unavailable",
            QaError::Embedding { .. } => "embedding_error",
            QaError::GenerationTimeout(_) => "generation_timeout",
            QaError::RateLimited(_) => "rate_limited",
            QaError::Service { .. } => "service_error",
            QaError::FallbackFailed(_) => "request_failed",
        }
    }

    pub fn embedding(message: impl Into<String>, transient: bool) -> Self {
        QaError::Embedding {
            message: message.into(),
            transient,
        }
    }

    pub fn service(message: impl Into<String>, transient: bool) -> Self {
        QaError::Service {
            message: message.into(),
            transient,
        }
    }
}
