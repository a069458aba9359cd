//! `qa ask`: answer one question in a fresh conversation.
//!
//! Tokens are printed as they arrive. A `Discard` event means the streamed
//! text was abandoned; a marker is printed and the replacement follows on a
//! new line.

use std::io::Write;

use anyhow::Result;
use futures::StreamExt;
use qa_harness_core::QaError;

use crate::engine::{Answer, AnswerEvent, AnswerOutcome, AnswerStream, QaEngine, REQUEST_FAILED};

pub async fn run_ask(engine: &QaEngine, question: &str, json: bool) -> Result<()> {
    let conversation = engine.store().create_conversation(None).await?;

    if json {
        let answer = engine.ask(&conversation.id, question).await?;
        println!("{}", serde_json::to_string_pretty(&answer)?);
        return Ok(());
    }

    let events = engine.answer(&conversation.id, question).await?;
    print_answer(events).await?;
    Ok(())
}

/// Print an answer stream to stdout and return the final answer.
pub async fn print_answer(mut events: AnswerStream) -> Result<Answer> {
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        match event {
            AnswerEvent::Token(token) => {
                print!("{}", token);
                stdout.flush()?;
            }
            AnswerEvent::Discard => {
                println!();
                println!("[answer interrupted]");
            }
            AnswerEvent::Completed(answer) => {
                println!();
                print_citations(&answer);
                return Ok(answer);
            }
            AnswerEvent::Errored(e) => {
                println!();
                return Err(e.into());
            }
        }
    }
    Err(QaError::FallbackFailed(REQUEST_FAILED.to_string()).into())
}

fn print_citations(answer: &Answer) {
    if let AnswerOutcome::Fallback { .. } = answer.outcome {
        return;
    }
    if answer.citations.is_empty() {
        println!("(no passages cited)");
        return;
    }
    println!();
    println!("Sources:");
    for (i, citation) in answer.citations.iter().enumerate() {
        println!(
            "  [{}] {} (offset {})",
            i + 1,
            citation.chunk_id,
            citation.source_offset
        );
    }
}
