//! # QA Harness Core
//!
//! Shared, runtime-agnostic logic for QA Harness: data model, semantic
//! index, retriever, conversation store, prompt assembly, generation
//! parameters, and the deterministic fallback responder.
//!
//! This crate contains no tokio, reqwest, filesystem I/O, or other
//! native-only dependencies. Timers, HTTP providers, and the request
//! orchestrator live in the `qa-harness` app crate.
//!
//! # Pipeline
//!
//! ```text
//! question ──► Retriever ──► ranked chunks ──┐
//!                                            ├──► PromptAssembler ──► AssembledPrompt
//! ConversationStore ──► history window ──────┘
//! ```

pub mod embedding;
pub mod error;
pub mod fallback;
pub mod index;
pub mod models;
pub mod params;
pub mod prompt;
pub mod retriever;
pub mod store;

pub use error::{FaultClass, QaError};
