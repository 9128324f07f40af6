//! Interactive dual-track answering.
//!
//! Reads one question per stdin line. For each question the cached fast
//! path and the generator run side by side: a cache hit is printed as soon
//! as it lands, and generated chunks stream as they arrive. Ctrl-C during an
//! answer disconnects that session; Ctrl-C at the prompt shuts down.
//!
//! Lines starting with `/` are commands:
//! - `/rate N`: rate the last generated answer once it is cached
//! - `/good`, `/bad`: feedback on the last fact served from the fast path
//! - `/quit`

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use uuid::Uuid;

use hope_core::{FastAnswer, FastSource, KnowledgeManager, UserContext, system_clock};
use hope_stream::{AskHandle, AskRequest, SessionStatus, StreamEvent, StreamingOrchestrator};

use crate::cli::ServeArgs;
use crate::commands::open_manager;
use crate::config::Config;
use crate::connectors;

/// What the last question left behind for follow-up commands
#[derive(Default)]
struct LastAnswer {
    session_id: Option<String>,
    fact_id: Option<String>,
}

#[derive(Debug, PartialEq)]
enum Input<'a> {
    Question(&'a str),
    Rate(u8),
    Feedback(bool),
    Quit,
    Invalid(&'a str),
    Empty,
}

fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Question(line);
    };
    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("quit" | "exit"), None) => Input::Quit,
        (Some("good"), None) => Input::Feedback(true),
        (Some("bad"), None) => Input::Feedback(false),
        (Some("rate"), Some(n)) => match n.parse::<u8>() {
            Ok(rating @ 1..=5) => Input::Rate(rating),
            _ => Input::Invalid(line),
        },
        _ => Input::Invalid(line),
    }
}

pub async fn execute(args: ServeArgs, config: &Config, json: bool) -> Result<()> {
    let clock = system_clock();
    let manager = Arc::new(open_manager(config, clock.clone())?);
    let connector = connectors::from_config(&config.generator)?;
    let orchestrator = StreamingOrchestrator::from_manager(manager.clone(), connector, clock);

    let sweeper = orchestrator.monitor().clone().spawn_sweeper();
    let maintenance = manager.clone().spawn_maintenance();
    let conversation = args
        .conversation
        .unwrap_or_else(|| format!("cli_{}", Uuid::new_v4().simple()));
    info!(
        conversation = %conversation,
        backend = ?config.generator.backend,
        "Serving questions from stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last = LastAnswer::default();
    loop {
        if !json {
            print!("{} ", ">".cyan().bold());
            std::io::stdout().flush()?;
        }
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else { break };

        match parse_input(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::Invalid(text) => println!("{} Unknown command: {}", "!".yellow(), text),
            Input::Rate(rating) => rate_last(&manager, &orchestrator, &last, rating).await,
            Input::Feedback(positive) => feedback_last(&manager, &last, positive),
            Input::Question(question) => {
                let mut request = AskRequest::new(question).with_conversation(&conversation);
                if let Some(user) = &args.user {
                    request = request.with_user(user);
                }
                let handle = orchestrator.ask_with(request).await?;
                last = answer(&orchestrator, handle, json).await?;
            }
        }
    }

    sweeper.abort();
    maintenance.abort();
    orchestrator.monitor().wait_for_cache_writes().await;
    manager.flush().context("Failed to persist knowledge tiers")?;
    info!("Serve stopped");
    Ok(())
}

/// Print both tracks until the session ends.
async fn answer(orchestrator: &StreamingOrchestrator, handle: AskHandle, json: bool) -> Result<LastAnswer> {
    let AskHandle {
        session_id,
        mut fast,
        mut events,
        generation,
        ..
    } = handle;
    let mut last = LastAnswer {
        session_id: Some(session_id.clone()),
        fact_id: None,
    };
    let mut fast_pending = true;
    let mut disconnected = false;

    loop {
        tokio::select! {
            result = &mut fast, if fast_pending => {
                fast_pending = false;
                match result {
                    Ok(hit) if hit.is_hit() => {
                        if hit.source == FastSource::Permanent {
                            last.fact_id = hit.entry_id.clone();
                        }
                        print_fast(&hit, json)?;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Fast path task failed"),
                }
            }
            event = events.recv() => match event {
                Some(event) => {
                    let terminal = event.is_terminal();
                    print_event(&event, json)?;
                    if terminal {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !disconnected => {
                disconnected = true;
                orchestrator.disconnect(&session_id, "client closed").await?;
            }
        }
    }

    if generation.await.unwrap_or(SessionStatus::Error) != SessionStatus::Completed {
        last.session_id = None;
    }
    Ok(last)
}

fn print_fast(hit: &FastAnswer, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(&serde_json::json!({ "type": "fast", "answer": hit }))?);
        return Ok(());
    }
    let Some(text) = &hit.answer else {
        return Ok(());
    };
    println!(
        "{} {} {:.0}% in {} ms",
        "[cached]".green().bold(),
        hit.source,
        hit.confidence * 100.0,
        hit.elapsed.as_millis()
    );
    println!("{text}");
    println!("{}", "[generating]".dimmed());
    Ok(())
}

fn print_event(event: &StreamEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        StreamEvent::Chunk { text, .. } => {
            print!("{text}");
            std::io::stdout().flush()?;
        }
        StreamEvent::Completed { chunks } => println!("\n{} {} chunk(s)", "✓".green(), chunks),
        StreamEvent::Interrupted { reason } => println!("\n{} interrupted: {}", "!".yellow(), reason),
        StreamEvent::Error { message } => println!("\n{} {}", "✗".red(), message),
    }
    Ok(())
}

async fn rate_last(
    manager: &KnowledgeManager,
    orchestrator: &StreamingOrchestrator,
    last: &LastAnswer,
    rating: u8,
) {
    let Some(session_id) = &last.session_id else {
        println!("{} No generated answer to rate", "!".yellow());
        return;
    };
    orchestrator.monitor().wait_for_cache_writes().await;
    let cached = manager
        .ordinary()
        .entries()
        .into_iter()
        .find(|e| e.session_id.as_deref() == Some(session_id.as_str()));
    let Some(cached) = cached else {
        println!("{} The last answer was not cached (too short or too quick)", "!".yellow());
        return;
    };
    match manager.rate_answer(&cached.id, rating, &UserContext::default(), cached.created_at) {
        Ok(updated) => {
            manager.ordinary().check_and_promote(manager.permanent());
            println!(
                "{} Rated {}  average {:.2}",
                "✓".green(),
                updated.id.dimmed(),
                updated.average_rating()
            );
        }
        Err(e) => println!("{} {}", "✗".red(), e),
    }
}

fn feedback_last(manager: &KnowledgeManager, last: &LastAnswer, positive: bool) {
    let Some(fact_id) = &last.fact_id else {
        println!("{} No fact was served for the last question", "!".yellow());
        return;
    };
    match manager.permanent().record_feedback(fact_id, positive) {
        Ok(fact) => println!("{} Feedback recorded for {}", "✓".green(), fact.id),
        Err(e) => println!("{} {}", "✗".red(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("  What is Rust?  "), Input::Question("What is Rust?"));
        assert_eq!(parse_input("   "), Input::Empty);
        assert_eq!(parse_input("/rate 4"), Input::Rate(4));
        assert_eq!(parse_input("/rate 9"), Input::Invalid("/rate 9"));
        assert_eq!(parse_input("/good"), Input::Feedback(true));
        assert_eq!(parse_input("/bad"), Input::Feedback(false));
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert_eq!(parse_input("/frobnicate"), Input::Invalid("/frobnicate"));
    }
}
