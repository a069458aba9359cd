//! Scripted fakes shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use qa_harness::engine::{AnswerEvent, AnswerStream, EngineParts, EngineSettings, QaEngine};
use qa_harness::generation::{GenerationClient, TokenStream};
use qa_harness::resilience::{CircuitBreaker, Resilience, RetryPolicy, GENERATION, RETRIEVAL};
use qa_harness_core::embedding::{EmbeddingProvider, Similarity};
use qa_harness_core::fallback::{FallbackContext, FallbackResponder, KnowledgeFallback};
use qa_harness_core::index::{IndexFile, IndexHandle, SemanticIndex};
use qa_harness_core::models::{Chunk, Message};
use qa_harness_core::params::GenerationParams;
use qa_harness_core::prompt::{AssembledPrompt, PromptAssembler};
use qa_harness_core::retriever::Retriever;
use qa_harness_core::store::memory::InMemoryConversationStore;
use qa_harness_core::store::HistoryWindow;
use qa_harness_core::QaError;

// ─── Index ──────────────────────────────────────────────────────────

pub const EMOTIVITY: &str = "Emotivity is the capacity of a being to be moved by what it perceives.";
pub const EMOTIONS: &str = "Emotions colour every judgement we make about the world.";
pub const LOGIC: &str = "Logic is the study of valid inference.";
pub const OTHER: &str = "The author was born in a small village.";

fn chunk(id: &str, text: &str, offset: u64, embedding: [f32; 3]) -> Chunk {
    Chunk {
        id: id.to_string(),
        text: text.to_string(),
        embedding: embedding.to_vec(),
        source_offset: offset,
    }
}

pub fn sample_index() -> IndexHandle {
    IndexHandle::from(SemanticIndex::from_file(IndexFile {
        model: "keyword-test".to_string(),
        dims: 3,
        metric: Similarity::Cosine,
        chunks: vec![
            chunk("c1", EMOTIVITY, 0, [1.0, 0.0, 0.0]),
            chunk("c2", EMOTIONS, 120, [0.9, 0.1, 0.0]),
            chunk("c3", LOGIC, 300, [0.0, 1.0, 0.0]),
            chunk("c4", OTHER, 500, [0.0, 0.0, 1.0]),
        ],
    }))
}

// ─── Embedding ──────────────────────────────────────────────────────

/// Maps questions onto the sample index axes by keyword.
#[derive(Default)]
pub struct KeywordEmbedder {
    pub calls: AtomicU32,
    failures: AtomicU32,
}

impl KeywordEmbedder {
    /// Fail the first `n` calls with a transient fault.
    pub fn flaky(n: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword-test"
    }

    fn dims(&self) -> usize {
        3
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, QaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(QaError::embedding("embedding service unavailable", true));
        }
        let text = text.to_lowercase();
        Ok(if text.contains("emotiv") {
            vec![1.0, 0.0, 0.0]
        } else if text.contains("logic") {
            vec![0.0, 1.0, 0.0]
        } else {
            vec![0.0, 0.0, 1.0]
        })
    }
}

// ─── Generation ─────────────────────────────────────────────────────

/// How a scripted reply ends after its tokens.
#[derive(Clone)]
pub enum Tail {
    End,
    Error(QaError),
    /// Never yields again.
    Stall,
}

#[derive(Clone)]
pub enum Call {
    Fail(QaError),
    Reply { tokens: Vec<String>, tail: Tail },
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Generation client that plays back queued calls, then a default reply.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Call>>,
    default_tokens: Vec<String>,
    pub calls: AtomicU32,
    pub prompts: Mutex<Vec<AssembledPrompt>>,
    /// Set once the most recent stream has been dropped.
    pub stream_dropped: Arc<AtomicBool>,
}

impl ScriptedGenerator {
    pub fn new(default_tokens: &[&str]) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_tokens: default_tokens.iter().map(|t| t.to_string()).collect(),
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
            stream_dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fail_next(self, n: usize, err: QaError) -> Self {
        {
            let mut script = self.script.lock();
            for _ in 0..n {
                script.push_back(Call::Fail(err.clone()));
            }
        }
        self
    }

    pub fn reply_next(self, tokens: &[&str], tail: Tail) -> Self {
        self.script.lock().push_back(Call::Reply {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            tail,
        });
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> AssembledPrompt {
        self.prompts.lock().last().cloned().expect("no prompt recorded")
    }
}

#[async_trait]
impl GenerationClient for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        prompt: &AssembledPrompt,
        _params: &GenerationParams,
    ) -> Result<TokenStream, QaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.clone());

        let call = self.script.lock().pop_front().unwrap_or_else(|| Call::Reply {
            tokens: self.default_tokens.clone(),
            tail: Tail::End,
        });
        let (tokens, tail) = match call {
            Call::Fail(err) => return Err(err),
            Call::Reply { tokens, tail } => (tokens, tail),
        };

        self.stream_dropped.store(false, Ordering::SeqCst);
        let flag = DropFlag(Arc::clone(&self.stream_dropped));
        let tail: TokenStream = match tail {
            Tail::End => stream::empty().boxed(),
            Tail::Error(err) => stream::once(async move { Err(err) }).boxed(),
            Tail::Stall => stream::pending().boxed(),
        };
        Ok(stream::iter(tokens.into_iter().map(Ok))
            .chain(tail)
            .map(move |item| {
                let _alive = &flag;
                item
            })
            .boxed())
    }
}

// ─── Fallback ───────────────────────────────────────────────────────

pub struct BrokenFallback;

impl FallbackResponder for BrokenFallback {
    fn respond(&self, _ctx: &FallbackContext<'_>) -> Result<Message, QaError> {
        Err(QaError::service("faq store offline", false))
    }
}

// ─── Engine ─────────────────────────────────────────────────────────

pub struct Options {
    pub index: IndexHandle,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub fallback: Arc<dyn FallbackResponder>,
    pub top_k: usize,
    pub history: HistoryWindow,
    pub retry_count: u32,
    pub breaker_threshold: u32,
    pub max_prompt_chars: usize,
    pub request_deadline: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            index: sample_index(),
            embedder: Arc::new(KeywordEmbedder::default()),
            fallback: Arc::new(KnowledgeFallback::default()),
            top_k: 2,
            history: HistoryWindow::Messages(10),
            retry_count: 3,
            breaker_threshold: 5,
            max_prompt_chars: 10_000,
            request_deadline: Duration::from_secs(120),
        }
    }
}

pub struct Harness {
    pub engine: QaEngine,
    pub store: Arc<InMemoryConversationStore>,
    pub generator: Arc<ScriptedGenerator>,
}

fn guard(name: &str, options: &Options) -> Resilience {
    Resilience::new(
        RetryPolicy {
            retry_count: options.retry_count,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(100),
            attempt_timeout: Duration::from_secs(5),
        },
        Arc::new(CircuitBreaker::new(
            name,
            options.breaker_threshold,
            Duration::from_secs(60),
        )),
    )
}

pub fn harness(generator: ScriptedGenerator, options: Options) -> Harness {
    let store = Arc::new(InMemoryConversationStore::new());
    let generator = Arc::new(generator);
    let engine = QaEngine::new(EngineParts {
        retriever: Retriever::new(options.index.clone(), Arc::clone(&options.embedder)),
        store: store.clone(),
        assembler: PromptAssembler::new("Answer from the passages.", options.max_prompt_chars),
        generator: generator.clone(),
        fallback: Arc::clone(&options.fallback),
        retrieval_guard: guard(RETRIEVAL, &options),
        generation_guard: guard(GENERATION, &options),
        settings: EngineSettings {
            top_k: options.top_k,
            history: options.history,
            request_deadline: options.request_deadline,
            params: GenerationParams::from_json(serde_json::json!({ "model_id": "scripted" }))
                .expect("valid params"),
        },
    });
    Harness {
        engine,
        store,
        generator,
    }
}

/// Drain a stream into its events.
pub async fn collect(mut events: AnswerStream) -> Vec<AnswerEvent> {
    let mut out = Vec::new();
    while let Some(event) = events.next().await {
        out.push(event);
    }
    out
}

/// Concatenated text the caller would display, honoring `Discard`.
pub fn visible_text(events: &[AnswerEvent]) -> String {
    let mut text = String::new();
    for event in events {
        match event {
            AnswerEvent::Token(t) => text.push_str(t),
            AnswerEvent::Discard => text.clear(),
            _ => {}
        }
    }
    text
}
