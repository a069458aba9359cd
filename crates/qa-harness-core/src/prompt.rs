//! Deterministic prompt assembly.
//!
//! [`PromptAssembler::assemble`] turns a question, a history window, and
//! ranked retrieval results into an ordered list of [`PromptMessage`]s:
//!
//! ```text
//! ┌──────────────────────────┐
//! │ system instructions      │  never dropped
//! ├──────────────────────────┤
//! │ context: [1] (offset …)  │  rank order; lowest rank dropped first
//! │          [2] (offset …)  │
//! ├──────────────────────────┤
//! │ history (chronological)  │  oldest dropped after all context is gone
//! ├──────────────────────────┤
//! │ current question         │  never dropped
//! └──────────────────────────┘
//! ```
//!
//! The size budget is counted in characters across all message bodies. When
//! the system instructions and question alone exceed it, the prompt is still
//! returned with [`AssembledPrompt::fits_budget`] set to `false`.

use serde::Serialize;

use crate::models::{ChunkRef, Message, RetrievalResult, Role};

const CONTEXT_HEADER: &str =
    "Answer using the reference passages below. Cite passages by their [n] tag.";
const NO_CONTEXT: &str = "(no relevant passages were found)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

impl PromptRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptRole::System => "system",
            PromptRole::User => "user",
            PromptRole::Assistant => "assistant",
        }
    }
}

impl From<Role> for PromptRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => PromptRole::User,
            Role::Assistant => PromptRole::Assistant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    fn new(role: PromptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    fn size(&self) -> usize {
        self.content.chars().count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssembledPrompt {
    pub messages: Vec<PromptMessage>,
    /// Chunks that made it into the prompt, in rank order.
    pub citations: Vec<ChunkRef>,
    pub dropped_chunks: usize,
    pub dropped_history: usize,
    pub fits_budget: bool,
}

impl AssembledPrompt {
    /// Total size in characters across all message bodies.
    pub fn size(&self) -> usize {
        self.messages.iter().map(PromptMessage::size).sum()
    }
}

#[derive(Debug, Clone)]
pub struct PromptAssembler {
    system_instructions: String,
    max_prompt_chars: usize,
}

impl PromptAssembler {
    pub fn new(system_instructions: impl Into<String>, max_prompt_chars: usize) -> Self {
        Self {
            system_instructions: system_instructions.into(),
            max_prompt_chars,
        }
    }

    pub fn max_prompt_chars(&self) -> usize {
        self.max_prompt_chars
    }

    pub fn assemble(
        &self,
        question: &str,
        history: &[Message],
        retrieved: &[RetrievalResult],
    ) -> AssembledPrompt {
        let system = PromptMessage::new(PromptRole::System, self.system_instructions.as_str());
        let question_msg = PromptMessage::new(PromptRole::User, question);
        let history_msgs: Vec<PromptMessage> = history
            .iter()
            .map(|m| PromptMessage::new(m.role.into(), m.content.as_str()))
            .collect();

        let fixed = system.size() + question_msg.size();
        let mut kept_chunks = retrieved.len();
        let mut first_history = 0usize;

        let total = |kept_chunks: usize, first_history: usize| -> usize {
            fixed
                + render_context(&retrieved[..kept_chunks]).chars().count()
                + history_msgs[first_history..]
                    .iter()
                    .map(PromptMessage::size)
                    .sum::<usize>()
        };

        while kept_chunks > 0 && total(kept_chunks, first_history) > self.max_prompt_chars {
            kept_chunks -= 1;
        }
        while first_history < history_msgs.len()
            && total(kept_chunks, first_history) > self.max_prompt_chars
        {
            first_history += 1;
        }
        let fits_budget = total(kept_chunks, first_history) <= self.max_prompt_chars;

        let mut messages = Vec::with_capacity(3 + history_msgs.len() - first_history);
        messages.push(system);
        messages.push(PromptMessage::new(
            PromptRole::System,
            render_context(&retrieved[..kept_chunks]),
        ));
        messages.extend(history_msgs[first_history..].iter().cloned());
        messages.push(question_msg);

        AssembledPrompt {
            messages,
            citations: retrieved[..kept_chunks]
                .iter()
                .map(RetrievalResult::chunk_ref)
                .collect(),
            dropped_chunks: retrieved.len() - kept_chunks,
            dropped_history: first_history,
            fits_budget,
        }
    }
}

fn render_context(chunks: &[RetrievalResult]) -> String {
    let mut out = String::from(CONTEXT_HEADER);
    out.push_str("\n\n");
    if chunks.is_empty() {
        out.push_str(NO_CONTEXT);
        return out;
    }
    for (i, result) in chunks.iter().enumerate() {
        if i > 0 {
            out.push_str("\n\n");
        }
        out.push_str(&format!(
            "[{}] (offset {})\n{}",
            i + 1,
            result.chunk.source_offset,
            result.chunk.text
        ));
    }
    out
}
