//! # QA Harness
//!
//! Retrieval-augmented question answering over a fixed reference text.
//!
//! A question is embedded, matched against a precomputed semantic index,
//! combined with recent conversation history into a bounded prompt, and
//! answered by a streaming generation backend. Retrieval and generation sit
//! behind retries and circuit breakers; when they cannot produce an answer,
//! a deterministic fallback does.
//!
//! ## Architecture
//!
//! ```text
//!              ┌───────────┐    ┌─────────────┐
//! question ──▶ │ Retriever │──▶ │   Prompt    │
//!              │ (index)   │    │  Assembler  │◀── history (store)
//!              └───────────┘    └──────┬──────┘
//!                    ▲                 ▼
//!               Resilience       ┌────────────┐
//!                    ▼           │ Generation │──▶ tokens ──▶ caller
//!               Fallback ◀────── │  Client    │
//!                                └────────────┘
//! ```
//!
//! Pure logic (index, store, prompt, fallback, fault taxonomy) lives in
//! `qa_harness_core`; this crate adds configuration, HTTP providers, the
//! resilience layer, the orchestrating [`engine::QaEngine`], and the
//! CLI and HTTP surfaces.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with profile overlays |
//! | [`embedding`] | Query embedding providers (OpenAI, Ollama) |
//! | [`generation`] | Streaming generation clients |
//! | [`resilience`] | Retry with backoff, circuit breaker |
//! | [`engine`] | Request state machine |
//! | [`session`] | Active-conversation selection |
//! | [`server`] | HTTP API |

pub mod ask;
pub mod chat;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod generation;
pub mod index;
pub mod logging;
pub mod resilience;
pub mod server;
pub mod session;
