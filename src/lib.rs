//! Mira: real-time conversational voice client.
//!
//! Maintains a persistent duplex connection to a remote responder, keeps an
//! ordered transcript, and speaks assistant replies through a synthesis
//! service with strictly ordered playback.
//!
//! # Architecture
//!
//! Independent pieces joined by async channels, orchestrated by one event
//! loop:
//! - **Connection manager**: one WebSocket to the responder, with
//!   unconditional fixed-delay reconnection
//! - **Synthesis client**: text (+ affect) → audio, cached by exact text
//! - **Playback queue**: strict FIFO, at most one active stream, speaking
//!   state on a `watch` channel for the avatar renderer
//! - **Session controller**: transcript state machine, reset gating,
//!   epoch-based invalidation of stale asynchronous results

pub mod config;
pub mod connection;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod transcript;
pub mod tts;

pub use config::ClientConfig;
pub use connection::{ConnectionManager, ConnectionState, ResponderLink};
pub use error::{Result, SessionError};
pub use playback::{AudioSink, CpalSink, PlaybackItem, PlaybackQueue};
pub use session::{SessionCommand, SessionController, SessionEvent, SessionHandle};
pub use transcript::{Role, Transcript, Turn};
pub use tts::{ElevenLabsClient, SpeechSynthesizer, SynthesizedSpeech, VoiceDescriptor};
