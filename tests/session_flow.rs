//! Integration tests for the full session stack.
//!
//! These exercise cross-module workflows with the real pieces: a live local
//! WebSocket responder, the HTTP synthesis client against a mock server, and
//! the session controller event loop. Only the audio device is stubbed.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mira::playback::{AudioSink, PlaybackItem};
use mira::session::{SessionCommand, SessionEvent, SessionController, SessionHandle};
use mira::tts::ElevenLabsClient;
use mira::{ClientConfig, ConnectionManager, ConnectionState, Result};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Sink that "plays" every item for a few milliseconds, then ends naturally.
struct AutoSink;

impl AudioSink for AutoSink {
    fn start(&mut self, _item: &PlaybackItem) -> Result<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(());
        });
        Ok(rx)
    }

    fn stop(&mut self) {}
}

/// Start a scripted responder: every inbound chat gets `reply` back,
/// repeated `repeats` times per message.
async fn start_responder(reply: &'static str, repeats: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut write, mut read) = ws.split();
        while let Some(Ok(msg)) = read.next().await {
            if !msg.is_text() {
                continue;
            }
            for _ in 0..repeats {
                write
                    .send(tokio_tungstenite::tungstenite::Message::Text(
                        reply.to_string(),
                    ))
                    .await
                    .unwrap();
            }
        }
    });
    format!("ws://{addr}/ws")
}

/// Mock synthesis service with one voice and always-successful synthesis.
async fn start_synthesis_service() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/voices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "voices": [{ "voice_id": "v1", "name": "Aria" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex("^/v1/text-to-speech/.*$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"mp3".to_vec()))
        .mount(&server)
        .await;
    server
}

struct Harness {
    handle: SessionHandle,
    connection_state: watch::Receiver<ConnectionState>,
    _synthesis: MockServer,
}

async fn start_session(responder_url: String) -> Harness {
    let synthesis = start_synthesis_service().await;

    let mut config = ClientConfig::default();
    config.connection.url = responder_url;
    config.connection.reconnect_delay_ms = 50;
    config.synthesis.api_url = synthesis.uri();

    let synthesizer = Arc::new(ElevenLabsClient::new(&config.synthesis, Some("key".into())));
    let (connection, inbound) =
        ConnectionManager::connect(&config.connection).expect("valid responder url");
    let connection_state = connection.state_watch();

    let handle = SessionController::spawn(
        &config,
        Box::new(connection),
        inbound,
        synthesizer,
        Box::new(AutoSink),
    );

    Harness {
        handle,
        connection_state,
        _synthesis: synthesis,
    }
}

async fn wait_for_open(state: &mut watch::Receiver<ConnectionState>) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while *state.borrow() != ConnectionState::Open {
            state.changed().await.expect("state channel alive");
        }
    })
    .await
    .expect("connection should open");
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event in time")
        .expect("session alive")
}

// ---------------------------------------------------------------------------
// Chat round trip with speech
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chat_round_trip_speaks_the_reply() {
    let url = start_responder(
        r#"{"response":"Tell me more about that.","sentiment":{"polarity":0.6}}"#,
        1,
    )
    .await;
    let mut h = start_session(url).await;
    wait_for_open(&mut h.connection_state).await;

    assert!(matches!(
        next_event(&mut h.handle.events).await,
        SessionEvent::VoicesLoaded { .. }
    ));

    // Watch speaking transitions from before the send so none are missed.
    let mut speaking = h.handle.speaking.clone();
    let (spoke_tx, spoke_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut saw_speaking = false;
        while speaking.changed().await.is_ok() {
            if *speaking.borrow() {
                saw_speaking = true;
            } else if saw_speaking {
                let _ = spoke_tx.send(());
                return;
            }
        }
    });

    h.handle
        .commands
        .send(SessionCommand::SendInput("I feel anxious today".into()))
        .unwrap();

    match next_event(&mut h.handle.events).await {
        SessionEvent::UserTurn { content } => assert_eq!(content, "I feel anxious today"),
        other => panic!("expected user turn, got {other:?}"),
    }
    assert!(matches!(
        next_event(&mut h.handle.events).await,
        SessionEvent::Loading { active: true }
    ));
    match next_event(&mut h.handle.events).await {
        SessionEvent::Loading { active } => assert!(!active),
        other => panic!("expected loading cleared, got {other:?}"),
    }
    match next_event(&mut h.handle.events).await {
        SessionEvent::AssistantTurn { content, replaced } => {
            assert_eq!(content, "Tell me more about that.");
            assert!(!replaced);
        }
        other => panic!("expected assistant turn, got {other:?}"),
    }

    // Speech goes on, then ends naturally.
    tokio::time::timeout(Duration::from_secs(2), spoke_rx)
        .await
        .expect("speech should start and finish")
        .expect("watcher alive");
}

// ---------------------------------------------------------------------------
// Duplicate replies revise the same turn
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_replies_revise_in_place() {
    let url = start_responder(r#"{"response":"one answer"}"#, 2).await;
    let mut h = start_session(url).await;
    wait_for_open(&mut h.connection_state).await;

    // Skip startup and send bookkeeping events until the first reply.
    h.handle
        .commands
        .send(SessionCommand::SendInput("hello".into()))
        .unwrap();

    let mut replaced_flags = Vec::new();
    while replaced_flags.len() < 2 {
        if let SessionEvent::AssistantTurn { replaced, .. } =
            next_event(&mut h.handle.events).await
        {
            replaced_flags.push(replaced);
        }
    }
    // First reply appends, the second revises the same in-flight turn.
    assert_eq!(replaced_flags, vec![false, true]);
}

// ---------------------------------------------------------------------------
// New-chat confirmation gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn new_chat_requires_confirmation_then_clears() {
    let url = start_responder(r#"{"response":"reply"}"#, 1).await;
    let mut h = start_session(url).await;
    wait_for_open(&mut h.connection_state).await;

    h.handle
        .commands
        .send(SessionCommand::SendInput("hi".into()))
        .unwrap();

    // Wait until the reply landed so the transcript is non-empty.
    loop {
        if matches!(
            next_event(&mut h.handle.events).await,
            SessionEvent::AssistantTurn { .. }
        ) {
            break;
        }
    }

    // Declined: nothing clears.
    h.handle.commands.send(SessionCommand::RequestNewChat).unwrap();
    assert!(matches!(
        next_event(&mut h.handle.events).await,
        SessionEvent::NewChatNeedsConfirmation
    ));
    h.handle.commands.send(SessionCommand::DeclineNewChat).unwrap();

    // Confirmed: session clears.
    h.handle.commands.send(SessionCommand::RequestNewChat).unwrap();
    assert!(matches!(
        next_event(&mut h.handle.events).await,
        SessionEvent::NewChatNeedsConfirmation
    ));
    h.handle.commands.send(SessionCommand::ConfirmNewChat).unwrap();
    assert!(matches!(
        next_event(&mut h.handle.events).await,
        SessionEvent::SessionCleared
    ));
}
