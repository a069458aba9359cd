//! Request orchestration.
//!
//! [`QaEngine::answer`] runs one question through the pipeline and hands the
//! caller a lazy [`AnswerStream`]. Each request walks a fixed state machine:
//!
//! ```text
//! RECEIVED → RETRIEVING → ASSEMBLING → GENERATING → STREAMING → COMPLETED
//!     └──────────┴────────────┴─────────────┴────────────┴──────► ERRORED
//! ```
//!
//! - Retrieval and the opening of the generation stream each go through
//!   their own [`Resilience`] wrapper (separate breakers).
//! - Retries exhausted, an open breaker, a structural fault, or the request
//!   deadline all route to the [`FallbackResponder`]; the request still ends
//!   `COMPLETED`, and [`AnswerOutcome::Fallback`] tells the caller why.
//! - Input faults (`InvalidParameter`, `ConversationNotFound`) and fallback
//!   failures end the request `ERRORED`.
//! - The question and the final answer are appended together, only once the
//!   answer is complete. Dropping the stream early appends nothing.
//!
//! Requests for the same conversation are serialized by a per-conversation
//! lock held for the lifetime of the stream; different conversations run in
//! parallel.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::{self, BoxStream, StreamExt};
use qa_harness_core::fallback::{FallbackContext, FallbackReason, FallbackResponder, KnowledgeFallback};
use qa_harness_core::index::IndexHandle;
use qa_harness_core::models::{ChunkRef, ConversationSummary, Message, QueryContext};
use qa_harness_core::params::GenerationParams;
use qa_harness_core::prompt::{AssembledPrompt, PromptAssembler};
use qa_harness_core::retriever::Retriever;
use qa_harness_core::store::{ConversationStore, HistoryWindow};
use qa_harness_core::{FaultClass, QaError};
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::config::Config;
use crate::embedding::create_provider;
use crate::generation::{create_client, GenerationClient, TokenStream};
use crate::resilience::{self, BreakerSnapshot, Resilience, ResilienceError};

/// Shown to the caller when even the fallback could not answer.
pub const REQUEST_FAILED: &str = "The request could not be completed. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Received,
    Retrieving,
    Assembling,
    Generating,
    Streaming,
    Completed,
    Errored,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Received => "RECEIVED",
            RequestState::Retrieving => "RETRIEVING",
            RequestState::Assembling => "ASSEMBLING",
            RequestState::Generating => "GENERATING",
            RequestState::Streaming => "STREAMING",
            RequestState::Completed => "COMPLETED",
            RequestState::Errored => "ERRORED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnswerOutcome {
    Generated,
    Fallback { reason: FallbackReason },
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub conversation_id: String,
    pub text: String,
    pub citations: Vec<ChunkRef>,
    pub outcome: AnswerOutcome,
    pub state: RequestState,
    pub retrieval_attempts: u32,
    pub generation_attempts: u32,
}

impl Answer {
    pub fn is_fallback(&self) -> bool {
        matches!(self.outcome, AnswerOutcome::Fallback { .. })
    }
}

/// One item of an answer stream. A stream ends with exactly one
/// `Completed` or `Errored`.
#[derive(Debug, Clone)]
pub enum AnswerEvent {
    /// Next fragment of answer text.
    Token(String),
    /// Drop every fragment received so far; a replacement follows.
    Discard,
    Completed(Answer),
    Errored(QaError),
}

pub type AnswerStream = BoxStream<'static, AnswerEvent>;

/// Tunables resolved once from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub top_k: usize,
    pub history: HistoryWindow,
    pub request_deadline: Duration,
    pub params: GenerationParams,
}

/// Everything the engine is built from.
pub struct EngineParts {
    pub retriever: Retriever,
    pub store: Arc<dyn ConversationStore>,
    pub assembler: PromptAssembler,
    pub generator: Arc<dyn GenerationClient>,
    pub fallback: Arc<dyn FallbackResponder>,
    pub retrieval_guard: Resilience,
    pub generation_guard: Resilience,
    pub settings: EngineSettings,
}

#[derive(Default)]
struct ConversationLocks {
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationLocks {
    async fn acquire(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(conversation_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    fn forget(&self, conversation_id: &str) {
        self.locks.lock().remove(conversation_id);
    }
}

struct Inner {
    parts: EngineParts,
    locks: ConversationLocks,
}

#[derive(Clone)]
pub struct QaEngine {
    inner: Arc<Inner>,
}

impl QaEngine {
    pub fn new(parts: EngineParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                parts,
                locks: ConversationLocks::default(),
            }),
        }
    }

    /// Wire real providers from configuration.
    pub fn from_config(
        config: &Config,
        index: IndexHandle,
        store: Arc<dyn ConversationStore>,
    ) -> Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        let generator = create_client(&config.generation)?;
        let fallback = KnowledgeFallback::new(
            config.fallback.topics.clone(),
            config.fallback.default_answer.clone(),
        );

        Ok(Self::new(EngineParts {
            retriever: Retriever::new(index, embedder),
            store,
            assembler: PromptAssembler::new(
                config.prompt.system_instructions.clone(),
                config.prompt.max_prompt_size,
            ),
            generator,
            fallback: Arc::new(fallback),
            retrieval_guard: Resilience::from_config(resilience::RETRIEVAL, &config.resilience),
            generation_guard: Resilience::from_config(resilience::GENERATION, &config.resilience),
            settings: EngineSettings {
                top_k: config.retrieval.top_k,
                history: config.memory.window(),
                request_deadline: config.resilience.request_deadline(),
                params: config.generation.params()?,
            },
        }))
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.inner.parts.store
    }

    pub fn index(&self) -> &IndexHandle {
        self.inner.parts.retriever.index()
    }

    pub async fn rename_conversation(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<ConversationSummary, QaError> {
        self.inner.parts.store.rename_conversation(conversation_id, title).await
    }

    /// Delete a conversation and its request lock. A request already in
    /// flight keeps its own handle on the lock and fails when it records.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), QaError> {
        self.inner.parts.store.delete_conversation(conversation_id).await?;
        self.inner.locks.forget(conversation_id);
        info!(conversation = %conversation_id, "conversation deleted");
        Ok(())
    }

    pub fn breakers(&self) -> Vec<BreakerSnapshot> {
        vec![
            self.inner.parts.retrieval_guard.breaker().snapshot(),
            self.inner.parts.generation_guard.breaker().snapshot(),
        ]
    }

    pub fn reset_breakers(&self) {
        self.inner.parts.retrieval_guard.breaker().reset();
        self.inner.parts.generation_guard.breaker().reset();
    }

    /// Start answering `question` in `conversation_id`.
    ///
    /// Input faults are returned immediately. Otherwise the call waits for
    /// any in-flight request on the same conversation, then returns the
    /// event stream. The request deadline starts once the wait is over.
    pub async fn answer(&self, conversation_id: &str, question: &str) -> Result<AnswerStream, QaError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(QaError::InvalidParameter("question must not be empty".into()));
        }
        let parts = &self.inner.parts;
        if !parts.store.contains(conversation_id).await {
            return Err(QaError::ConversationNotFound(conversation_id.to_string()));
        }

        let guard = self.inner.locks.acquire(conversation_id).await;
        let span = tracing::info_span!("qa_request", conversation = %conversation_id);
        let pipeline = Pipeline {
            inner: Arc::clone(&self.inner),
            conversation_id: conversation_id.to_string(),
            question: Message::user(question),
            deadline: Instant::now() + parts.settings.request_deadline,
            state: RequestState::Received,
            stage: Stage::Start,
            citations: Vec::new(),
            retrieved: Vec::new(),
            retrieval_attempts: 0,
            generation_attempts: 0,
            queue: VecDeque::new(),
            span,
            _guard: guard,
        };
        Ok(pipeline.into_stream())
    }

    /// Drive [`answer`](Self::answer) to the end and return the final answer.
    pub async fn ask(&self, conversation_id: &str, question: &str) -> Result<Answer, QaError> {
        let mut events = self.answer(conversation_id, question).await?;
        while let Some(event) = events.next().await {
            match event {
                AnswerEvent::Completed(answer) => return Ok(answer),
                AnswerEvent::Errored(e) => return Err(e),
                AnswerEvent::Token(_) | AnswerEvent::Discard => {}
            }
        }
        Err(QaError::FallbackFailed(REQUEST_FAILED.to_string()))
    }
}

enum Stage {
    Start,
    Streaming { tokens: TokenStream, text: String },
    Done,
}

/// A generation stream whose first fragment has already been read, so that
/// failures surfacing on the first read are retried like connection errors.
struct Primed {
    first: Option<String>,
    tokens: TokenStream,
}

async fn open_primed(
    generator: &dyn GenerationClient,
    prompt: &AssembledPrompt,
    params: &GenerationParams,
) -> Result<Primed, QaError> {
    let mut tokens = generator.generate(prompt, params).await?;
    let first = tokens.next().await.transpose()?;
    Ok(Primed { first, tokens })
}

/// Map a wrapper failure to a fallback reason, or to a fault the caller
/// must see as-is.
fn fallback_reason(err: ResilienceError<QaError>) -> Result<FallbackReason, QaError> {
    match err {
        ResilienceError::Rejected(e) if e.class() == FaultClass::Input => Err(e),
        ResilienceError::Rejected(e) => Ok(FallbackReason::Unavailable {
            detail: e.to_string(),
        }),
        ResilienceError::Exhausted { attempts, last } => Ok(FallbackReason::RetriesExhausted {
            attempts,
            last_error: last.to_string(),
        }),
        ResilienceError::CircuitOpen { retry_in } => Ok(FallbackReason::CircuitOpen {
            retry_in_secs: retry_in.as_secs_f64().ceil() as u64,
        }),
        ResilienceError::DeadlineExceeded { .. } => Ok(FallbackReason::DeadlineExceeded),
    }
}

/// Per-request state driven by the answer stream.
struct Pipeline {
    inner: Arc<Inner>,
    conversation_id: String,
    question: Message,
    deadline: Instant,
    state: RequestState,
    stage: Stage,
    /// Chunks included in the prompt.
    citations: Vec<ChunkRef>,
    /// Everything retrieval returned, for the fallback context.
    retrieved: Vec<ChunkRef>,
    retrieval_attempts: u32,
    generation_attempts: u32,
    queue: VecDeque<AnswerEvent>,
    span: Span,
    _guard: OwnedMutexGuard<()>,
}

impl Pipeline {
    fn into_stream(self) -> AnswerStream {
        stream::unfold(self, |mut pipeline| async move {
            let span = pipeline.span.clone();
            let event = pipeline.next_event().instrument(span).await;
            event.map(|e| (e, pipeline))
        })
        .boxed()
    }

    fn transition(&mut self, next: RequestState) {
        debug!(from = %self.state, to = %next, "request state");
        self.state = next;
    }

    async fn next_event(&mut self) -> Option<AnswerEvent> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(event);
            }
            match std::mem::replace(&mut self.stage, Stage::Done) {
                Stage::Done => return None,
                Stage::Start => self.prepare().await,
                Stage::Streaming { mut tokens, mut text } => {
                    match tokio::time::timeout_at(self.deadline, tokens.next()).await {
                        Ok(Some(Ok(token))) => {
                            text.push_str(&token);
                            self.stage = Stage::Streaming { tokens, text };
                            return Some(AnswerEvent::Token(token));
                        }
                        Ok(Some(Err(e))) => {
                            drop(tokens);
                            warn!(error = %e, "answer stream broke");
                            if e.is_transient() {
                                self.inner.parts.generation_guard.breaker().record_failure();
                            }
                            self.queue.push_back(AnswerEvent::Discard);
                            self.fall_back(FallbackReason::StreamInterrupted {
                                detail: e.to_string(),
                            })
                            .await;
                        }
                        Ok(None) => {
                            drop(tokens);
                            self.complete(text).await;
                        }
                        Err(_) => {
                            drop(tokens);
                            warn!("request deadline passed while streaming");
                            if !text.is_empty() {
                                self.queue.push_back(AnswerEvent::Discard);
                            }
                            self.fall_back(FallbackReason::DeadlineExceeded).await;
                        }
                    }
                }
            }
        }
    }

    /// RETRIEVING → ASSEMBLING → GENERATING, ending in STREAMING or a
    /// terminal event.
    async fn prepare(&mut self) {
        let inner = Arc::clone(&self.inner);
        let parts = &inner.parts;
        let question = self.question.content.clone();

        self.transition(RequestState::Retrieving);
        let retrieved = match parts
            .retrieval_guard
            .call(self.deadline, |_| {
                parts.retriever.retrieve(&question, parts.settings.top_k)
            })
            .await
        {
            Ok(attempted) => {
                self.retrieval_attempts = attempted.attempts;
                attempted.value
            }
            Err(e) => return self.give_up(e).await,
        };
        self.retrieved = retrieved.iter().map(|r| r.chunk_ref()).collect();

        self.transition(RequestState::Assembling);
        let history = match parts
            .store
            .get_history(&self.conversation_id, parts.settings.history)
            .await
        {
            Ok(history) => history,
            Err(e) => return self.errored(e),
        };
        let context = QueryContext {
            question,
            history_window: history,
            retrieved,
        };
        let prompt = parts
            .assembler
            .assemble(&context.question, &context.history_window, &context.retrieved);
        if !prompt.fits_budget {
            warn!(
                size = prompt.size(),
                budget = parts.assembler.max_prompt_chars(),
                "prompt exceeds budget with only mandatory parts"
            );
        }
        debug!(
            included = prompt.citations.len(),
            dropped_chunks = prompt.dropped_chunks,
            dropped_history = prompt.dropped_history,
            "prompt assembled"
        );
        self.citations = prompt.citations.clone();

        self.transition(RequestState::Generating);
        let opened = parts
            .generation_guard
            .call(self.deadline, |_| {
                open_primed(parts.generator.as_ref(), &prompt, &parts.settings.params)
            })
            .await;
        match opened {
            Ok(attempted) => {
                self.generation_attempts = attempted.attempts;
                self.transition(RequestState::Streaming);
                let Primed { first, tokens } = attempted.value;
                let mut text = String::new();
                if let Some(token) = first.filter(|t| !t.is_empty()) {
                    text.push_str(&token);
                    self.queue.push_back(AnswerEvent::Token(token));
                }
                self.stage = Stage::Streaming { tokens, text };
            }
            Err(e) => self.give_up(e).await,
        }
    }

    async fn give_up(&mut self, err: ResilienceError<QaError>) {
        match fallback_reason(err) {
            Ok(reason) => self.fall_back(reason).await,
            Err(e) => self.errored(e),
        }
    }

    /// Append the question and the generated answer, then finish.
    async fn complete(&mut self, text: String) {
        if text.trim().is_empty() {
            if !text.is_empty() {
                self.queue.push_back(AnswerEvent::Discard);
            }
            return self
                .fall_back(FallbackReason::Unavailable {
                    detail: "empty completion".into(),
                })
                .await;
        }
        let answer = Message::assistant(text.clone(), self.citations.clone());
        if let Err(e) = self.record(answer).await {
            return self.errored(e);
        }
        self.transition(RequestState::Completed);
        info!(
            chars = text.len(),
            citations = self.citations.len(),
            attempts = self.generation_attempts,
            "answer completed"
        );
        let answer = self.answer(text, AnswerOutcome::Generated, self.citations.clone());
        self.queue.push_back(AnswerEvent::Completed(answer));
    }

    async fn fall_back(&mut self, reason: FallbackReason) {
        warn!(?reason, "answering with fallback");
        let responded = {
            let ctx = FallbackContext {
                question: &self.question.content,
                reason: &reason,
                retrieved: &self.retrieved,
            };
            self.inner.parts.fallback.respond(&ctx)
        };
        let message = match responded {
            Ok(message) if !message.content.trim().is_empty() => message,
            Ok(_) => {
                error!("fallback responder returned an empty message");
                return self.errored(QaError::FallbackFailed(REQUEST_FAILED.into()));
            }
            Err(e) => {
                error!(error = %e, "fallback responder failed");
                return self.errored(QaError::FallbackFailed(REQUEST_FAILED.into()));
            }
        };

        let text = message.content.clone();
        let citations = message.context_refs.clone();
        if let Err(e) = self.record(message).await {
            return self.errored(e);
        }
        self.transition(RequestState::Completed);
        let answer = self.answer(text.clone(), AnswerOutcome::Fallback { reason }, citations);
        self.queue.push_back(AnswerEvent::Token(text));
        self.queue.push_back(AnswerEvent::Completed(answer));
    }

    fn errored(&mut self, err: QaError) {
        self.transition(RequestState::Errored);
        warn!(error = %err, "request errored");
        self.stage = Stage::Done;
        self.queue.push_back(AnswerEvent::Errored(err));
    }

    /// Append question and answer as one unit.
    async fn record(&mut self, answer: Message) -> Result<(), QaError> {
        self.inner
            .parts
            .store
            .append_messages(&self.conversation_id, vec![self.question.clone(), answer])
            .await
    }

    fn answer(&self, text: String, outcome: AnswerOutcome, citations: Vec<ChunkRef>) -> Answer {
        Answer {
            conversation_id: self.conversation_id.clone(),
            text,
            citations,
            outcome,
            state: self.state,
            retrieval_attempts: self.retrieval_attempts,
            generation_attempts: self.generation_attempts,
        }
    }
}
