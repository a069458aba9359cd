//! `qa chat`: interactive session over the in-memory store.
//!
//! | Input | Effect |
//! |-------|--------|
//! | `/new [title]` | Start a conversation and make it active |
//! | `/list` | List conversations |
//! | `/switch <id>` | Make another conversation active |
//! | `/rename <title>` | Retitle the active conversation |
//! | `/delete <id>` | Delete a conversation |
//! | `/history` | Print the active conversation |
//! | `/quit` | Leave |
//! | anything else | Ask it in the active conversation |
//!
//! Ctrl-C while an answer is streaming cancels that answer only; nothing is
//! recorded for it.

use std::io::Write;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::ask::print_answer;
use crate::engine::QaEngine;
use crate::session::ChatSession;

enum Command<'a> {
    New(Option<&'a str>),
    List,
    Switch(&'a str),
    Rename(&'a str),
    Delete(&'a str),
    History,
    Help,
    Quit,
    Ask(&'a str),
    Unknown(&'a str),
}

fn parse_command(line: &str) -> Command<'_> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Ask(line);
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    match name {
        "new" => Command::New(Some(arg).filter(|a| !a.is_empty())),
        "list" => Command::List,
        "switch" if !arg.is_empty() => Command::Switch(arg),
        "rename" if !arg.is_empty() => Command::Rename(arg),
        "delete" if !arg.is_empty() => Command::Delete(arg),
        "history" => Command::History,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => Command::Unknown(line),
    }
}

pub async fn run_chat(engine: &QaEngine) -> Result<()> {
    let mut session = ChatSession::new(engine.store().clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Ask a question, or /help for commands.");
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_command(&line) {
            Command::Quit => break,
            Command::Help => {
                println!("/new [title]   start a conversation");
                println!("/list          list conversations");
                println!("/switch <id>   switch conversation");
                println!("/rename <title> retitle the active conversation");
                println!("/delete <id>   delete a conversation");
                println!("/history       show the active conversation");
                println!("/quit          leave");
            }
            Command::New(title) => {
                let conv = session.new_conversation(title.map(str::to_string)).await?;
                println!("Started \"{}\" ({})", conv.title, conv.id);
            }
            Command::List => {
                let summaries = session.list().await?;
                if summaries.is_empty() {
                    println!("No conversations yet.");
                }
                for s in summaries {
                    let marker = if session.active() == Some(s.id.as_str()) { "*" } else { " " };
                    println!(
                        "{} {}  {}  ({} messages, last {})",
                        marker,
                        s.id,
                        s.title,
                        s.message_count,
                        s.last_activity.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
            Command::Switch(id) => match session.switch(id).await {
                Ok(()) => println!("Switched to {}", id),
                Err(e) => println!("{}", e),
            },
            Command::Rename(title) => match session.rename_active(title).await {
                Ok(summary) => println!("Renamed to \"{}\"", summary.title),
                Err(e) => println!("{}", e),
            },
            Command::Delete(id) => match engine.delete_conversation(id).await {
                Ok(()) => {
                    session.forget(id);
                    println!("Deleted {}", id);
                }
                Err(e) => println!("{}", e),
            },
            Command::History => {
                let Some(id) = session.active() else {
                    println!("No active conversation.");
                    continue;
                };
                let conv = engine.store().get_conversation(id).await?;
                println!("== {} ==", conv.title);
                for message in &conv.messages {
                    println!("[{:?}] {}", message.role, message.content);
                }
            }
            Command::Unknown(input) => println!("Unknown command: {}", input),
            Command::Ask(question) => {
                let id = session.ensure_active().await?;
                let events = match engine.answer(&id, question).await {
                    Ok(events) => events,
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };
                tokio::select! {
                    result = print_answer(events) => {
                        if let Err(e) = result {
                            println!("Error: {}", e);
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("[cancelled]");
                    }
                }
            }
        }
    }
    Ok(())
}
