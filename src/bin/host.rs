//! Terminal host for the conversational client.
//!
//! Reads newline-delimited commands from stdin and prints transcript and
//! state changes to stdout. Plain lines are chat sends; slash commands drive
//! the session:
//!
//! ```text
//! /new           start a new chat (asks to confirm when non-empty)
//! /yes /no       answer the new-chat confirmation
//! /speech        toggle automatic speech
//! /voice <n>     select voice n from the catalog
//! /say <idx>     speak a past assistant turn (queued)
//! /say! <idx>    speak it now, cutting off current speech
//! /up <idx>      rate a turn helpful
//! /down <idx>    rate a turn unhelpful
//! /quit          exit
//! ```
//!
//! Tracing goes to stderr so stdout stays readable.

use mira::playback::CpalSink;
use mira::session::{SessionCommand, SessionEvent, SessionController};
use mira::tts::ElevenLabsClient;
use mira::{ClientConfig, ConnectionManager};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ClientConfig::load_or_default()?;
    let api_key = config.synthesis_api_key();

    let synthesizer = Arc::new(ElevenLabsClient::new(&config.synthesis, api_key));
    let (connection, inbound) = ConnectionManager::connect(&config.connection)?;
    let session = SessionController::spawn(
        &config,
        Box::new(connection),
        inbound,
        synthesizer,
        Box::new(CpalSink::new()),
    );

    // Print session events as they happen.
    let mut events = session.events;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::UserTurn { content } => println!("you: {content}"),
                SessionEvent::AssistantTurn { content, replaced } => {
                    if replaced {
                        println!("assistant (revised): {content}");
                    } else {
                        println!("assistant: {content}");
                    }
                }
                SessionEvent::Loading { active } => {
                    if active {
                        println!("…");
                    }
                }
                SessionEvent::SpeechEnabled { enabled } => {
                    println!("[speech {}]", if enabled { "on" } else { "off" });
                }
                SessionEvent::NewChatNeedsConfirmation => {
                    println!("[clear the current conversation? /yes or /no]");
                }
                SessionEvent::SessionCleared => println!("[new chat]"),
                SessionEvent::VoicesLoaded { names } => {
                    println!("[voices: {}]", names.join(", "));
                }
                SessionEvent::VoiceSelected { name } => println!("[voice: {name}]"),
            }
        }
    });

    // Speaking transitions, for anyone watching the terminal instead of an
    // avatar.
    let mut speaking = session.speaking.clone();
    tokio::spawn(async move {
        while speaking.changed().await.is_ok() {
            let value = *speaking.borrow();
            tracing::debug!("speaking: {value}");
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Some(command) = parse_line(&line) else {
            continue;
        };
        let quitting = matches!(command, SessionCommand::Shutdown);
        if session.commands.send(command).is_err() || quitting {
            break;
        }
    }

    printer.abort();
    Ok(())
}

/// Turn one input line into a session command. `None` for blank lines and
/// malformed slash commands.
fn parse_line(line: &str) -> Option<SessionCommand> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(SessionCommand::SendInput(line.to_owned()));
    }

    let mut parts = line.splitn(2, ' ');
    let verb = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim);
    match (verb, arg) {
        ("/new", _) => Some(SessionCommand::RequestNewChat),
        ("/yes", _) => Some(SessionCommand::ConfirmNewChat),
        ("/no", _) => Some(SessionCommand::DeclineNewChat),
        ("/speech", _) => Some(SessionCommand::ToggleSpeech),
        ("/voice", Some(n)) => n.parse().ok().map(SessionCommand::SelectVoice),
        ("/say", Some(idx)) => idx.parse().ok().map(|msg_idx| SessionCommand::SpeakMessage {
            msg_idx,
            interrupt: false,
        }),
        ("/say!", Some(idx)) => idx.parse().ok().map(|msg_idx| SessionCommand::SpeakMessage {
            msg_idx,
            interrupt: true,
        }),
        ("/up", Some(idx)) => idx.parse().ok().map(|msg_idx| SessionCommand::SendFeedback {
            msg_idx,
            rating: 1,
        }),
        ("/down", Some(idx)) => idx.parse().ok().map(|msg_idx| SessionCommand::SendFeedback {
            msg_idx,
            rating: -1,
        }),
        ("/quit", _) => Some(SessionCommand::Shutdown),
        _ => {
            eprintln!("unknown command: {line}");
            None
        }
    }
}
