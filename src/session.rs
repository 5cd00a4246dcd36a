//! Session controller: the orchestrator over transcript, connection,
//! synthesis, and playback.
//!
//! A single event loop drives everything: user commands, inbound responder
//! messages, asynchronous synthesis completions, and playback completions
//! all arrive on channels and are processed in order on one task. Transcript
//! mutations are therefore serialized by construction.
//!
//! Resets bump a session epoch; any synthesis completion spawned under an
//! older epoch is discarded when it arrives, so speech for a conversation
//! that no longer exists is never played.

use crate::config::ClientConfig;
use crate::connection::ResponderLink;
use crate::playback::{AudioSink, PlaybackItem, PlaybackQueue};
use crate::protocol::{FeedbackPayload, InboundKind, InboundMessage, OutboundMessage};
use crate::transcript::{Role, Transcript};
use crate::tts::{SpeechSynthesizer, SynthesizedSpeech, VoiceDescriptor};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Commands from the presentation layer.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Send a user chat turn. Empty/whitespace input is silently rejected.
    SendInput(String),
    /// Begin the new-chat flow; asks for confirmation when the transcript
    /// is non-empty.
    RequestNewChat,
    /// Confirm a pending new-chat request.
    ConfirmNewChat,
    /// Decline a pending new-chat request; nothing changes.
    DeclineNewChat,
    /// Flip automatic speech for assistant replies.
    ToggleSpeech,
    /// Select a voice by catalog index.
    SelectVoice(usize),
    /// Rate a past assistant turn. Fire-and-forget; no local state changes.
    SendFeedback { msg_idx: usize, rating: i8 },
    /// Speak a specific past assistant turn; `interrupt` cuts off any
    /// current speech, otherwise the utterance queues behind it.
    SpeakMessage { msg_idx: usize, interrupt: bool },
    /// Stop the session.
    Shutdown,
}

/// Events for the presentation layer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A user turn was appended.
    UserTurn { content: String },
    /// An assistant turn was appended or, for a reply still being revised,
    /// replaced in place.
    AssistantTurn { content: String, replaced: bool },
    /// Whether a reply is pending.
    Loading { active: bool },
    /// Automatic speech was toggled.
    SpeechEnabled { enabled: bool },
    /// New-chat was requested over a non-empty transcript; the UI must
    /// confirm or decline before anything happens.
    NewChatNeedsConfirmation,
    /// The transcript (and everything queued) was cleared.
    SessionCleared,
    /// Voice catalog became available.
    VoicesLoaded { names: Vec<String> },
    /// The user picked a voice.
    VoiceSelected { name: String },
}

/// Completion of an asynchronous synthesis call.
struct SynthesisOutcome {
    /// Session epoch at spawn time; stale outcomes are discarded.
    epoch: u64,
    result: crate::error::Result<SynthesizedSpeech>,
    /// Whether playback should preempt the current utterance.
    interrupt: bool,
}

/// Handle to a running session.
pub struct SessionHandle {
    pub commands: mpsc::UnboundedSender<SessionCommand>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    /// True while synthesized speech is audibly playing. This is the single
    /// signal the avatar renderer consumes.
    pub speaking: watch::Receiver<bool>,
}

/// The session state machine. Owns the transcript, the playback queue, and
/// the speech settings; talks to the responder through [`ResponderLink`].
pub struct SessionController {
    user_id: String,
    transcript: Transcript,
    loading: bool,
    speech_enabled: bool,
    voices: Vec<VoiceDescriptor>,
    selected_voice: Option<usize>,
    reset_pending: bool,
    epoch: u64,
    link: Box<dyn ResponderLink>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    queue: PlaybackQueue,
    synth_tx: mpsc::UnboundedSender<SynthesisOutcome>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionController {
    /// Build a session and spawn its event loop.
    pub fn spawn(
        config: &ClientConfig,
        link: Box<dyn ResponderLink>,
        inbound: mpsc::UnboundedReceiver<InboundMessage>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        sink: Box<dyn AudioSink>,
    ) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (controller, event_rx, speaking_rx, synth_rx, finished_rx) =
            Self::new(config, link, synthesizer, sink);

        tokio::spawn(controller.run(command_rx, inbound, synth_rx, finished_rx));

        SessionHandle {
            commands: command_tx,
            events: event_rx,
            speaking: speaking_rx,
        }
    }

    #[allow(clippy::type_complexity)]
    fn new(
        config: &ClientConfig,
        link: Box<dyn ResponderLink>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        sink: Box<dyn AudioSink>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<SessionEvent>,
        watch::Receiver<bool>,
        mpsc::UnboundedReceiver<SynthesisOutcome>,
        mpsc::UnboundedReceiver<u64>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (synth_tx, synth_rx) = mpsc::unbounded_channel();
        let (queue, finished_rx, speaking_rx) = PlaybackQueue::new(sink);

        (
            Self {
                user_id: config.connection.user_id.clone(),
                transcript: Transcript::new(),
                loading: false,
                speech_enabled: config.speech.enabled,
                voices: Vec::new(),
                selected_voice: None,
                reset_pending: false,
                epoch: 0,
                link,
                synthesizer,
                queue,
                synth_tx,
                event_tx,
            },
            event_rx,
            speaking_rx,
            synth_rx,
            finished_rx,
        )
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
        mut synth_rx: mpsc::UnboundedReceiver<SynthesisOutcome>,
        mut finished_rx: mpsc::UnboundedReceiver<u64>,
    ) {
        self.load_voices().await;

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                Some(msg) = inbound.recv() => self.handle_inbound(&msg),
                Some(outcome) = synth_rx.recv() => self.handle_synthesis(outcome),
                Some(generation) = finished_rx.recv() => {
                    self.queue.handle_finished(generation);
                }
            }
        }

        self.queue.clear();
        self.link.shutdown();
        info!("session stopped");
    }

    /// Fetch the voice catalog once at startup. On failure, speech is
    /// disabled for the session; text interaction continues.
    async fn load_voices(&mut self) {
        match self.synthesizer.fetch_voices().await {
            Ok(voices) => {
                let names = voices.iter().map(|v| v.name.clone()).collect();
                self.voices = voices;
                self.emit(SessionEvent::VoicesLoaded { names });
            }
            Err(e) => {
                warn!("voice catalog unavailable, disabling speech: {e}");
                self.speech_enabled = false;
                self.emit(SessionEvent::SpeechEnabled { enabled: false });
            }
        }
    }

    /// Returns false when the session should shut down.
    fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::SendInput(text) => self.send_input(&text),
            SessionCommand::RequestNewChat => self.request_new_chat(),
            SessionCommand::ConfirmNewChat => self.confirm_new_chat(),
            SessionCommand::DeclineNewChat => self.decline_new_chat(),
            SessionCommand::ToggleSpeech => self.toggle_speech(),
            SessionCommand::SelectVoice(idx) => self.select_voice(idx),
            SessionCommand::SendFeedback { msg_idx, rating } => {
                self.send_feedback(msg_idx, rating);
            }
            SessionCommand::SpeakMessage { msg_idx, interrupt } => {
                self.speak_message(msg_idx, interrupt);
            }
            SessionCommand::Shutdown => return false,
        }
        true
    }

    fn send_input(&mut self, text: &str) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            debug!("rejecting empty input");
            return;
        }
        if !self.link.is_open() {
            // No queueing and no local echo of input that cannot be
            // delivered; at-most-once, never retried.
            warn!("input dropped: connection not open");
            return;
        }

        self.transcript.push_user(trimmed);
        self.emit(SessionEvent::UserTurn {
            content: trimmed.to_owned(),
        });
        self.link.send(&OutboundMessage::Chat {
            user_id: self.user_id.clone(),
            input: trimmed.to_owned(),
            sentiment: None,
        });
        self.set_loading(true);
    }

    fn handle_inbound(&mut self, msg: &InboundMessage) {
        match msg.kind() {
            InboundKind::Response(text) => {
                let replaced = self.transcript.has_in_flight();
                self.transcript.push_assistant(&text);
                self.set_loading(false);
                self.emit(SessionEvent::AssistantTurn {
                    content: text.clone(),
                    replaced,
                });
                if self.speech_enabled {
                    self.spawn_synthesis(text, msg.polarity(), false);
                }
            }
            InboundKind::Error(text) => {
                // Responder errors are surfaced verbatim in the transcript;
                // the conversation continues. No speech for errors.
                let replaced = self.transcript.has_in_flight();
                self.transcript.push_assistant(&text);
                self.set_loading(false);
                self.emit(SessionEvent::AssistantTurn {
                    content: text,
                    replaced,
                });
            }
            InboundKind::Streak(count) => {
                // Auxiliary signal; inert with respect to the transcript.
                info!("streak: {count}");
            }
            InboundKind::Empty => {
                debug!("ignoring inbound message with no meaningful payload");
            }
        }
    }

    fn request_new_chat(&mut self) {
        if self.transcript.is_empty() {
            self.reset();
        } else {
            self.reset_pending = true;
            self.emit(SessionEvent::NewChatNeedsConfirmation);
        }
    }

    fn confirm_new_chat(&mut self) {
        if self.reset_pending {
            self.reset();
        }
    }

    fn decline_new_chat(&mut self) {
        self.reset_pending = false;
    }

    /// Clear everything and invalidate in-flight asynchronous work.
    fn reset(&mut self) {
        self.epoch += 1;
        self.transcript.clear();
        self.queue.clear();
        self.set_loading(false);
        self.reset_pending = false;
        self.emit(SessionEvent::SessionCleared);
    }

    fn toggle_speech(&mut self) {
        if self.queue.is_speaking() {
            self.queue.clear();
        }
        self.speech_enabled = !self.speech_enabled;
        self.emit(SessionEvent::SpeechEnabled {
            enabled: self.speech_enabled,
        });
    }

    fn select_voice(&mut self, idx: usize) {
        if let Some(voice) = self.voices.get(idx) {
            let name = voice.name.clone();
            self.selected_voice = Some(idx);
            self.emit(SessionEvent::VoiceSelected { name });
        } else {
            warn!("ignoring selection of unknown voice index {idx}");
        }
    }

    fn send_feedback(&mut self, msg_idx: usize, rating: i8) {
        if rating != 1 && rating != -1 {
            warn!("ignoring feedback with invalid rating {rating}");
            return;
        }
        self.link.send(&OutboundMessage::Feedback {
            feedback: FeedbackPayload { msg_idx, rating },
        });
    }

    fn speak_message(&mut self, msg_idx: usize, interrupt: bool) {
        let Some(turn) = self.transcript.get(msg_idx) else {
            warn!("cannot speak unknown turn {msg_idx}");
            return;
        };
        if turn.role != Role::Assistant {
            return;
        }
        self.spawn_synthesis(turn.content.clone(), 0.0, interrupt);
    }

    /// The voice sent with synthesis requests: explicit selection first,
    /// else the first catalog entry. `None` lets the synthesizer fall back
    /// to its hard-coded default.
    fn voice_id(&self) -> Option<String> {
        self.selected_voice
            .and_then(|idx| self.voices.get(idx))
            .or_else(|| self.voices.first())
            .map(|v| v.voice_id.clone())
    }

    /// Fire a synthesis call without blocking the event loop. The outcome
    /// comes back through the synthesis channel tagged with the current
    /// epoch.
    fn spawn_synthesis(&mut self, text: String, affect: f32, interrupt: bool) {
        let epoch = self.epoch;
        let voice = self.voice_id();
        let synthesizer = Arc::clone(&self.synthesizer);
        let tx = self.synth_tx.clone();
        tokio::spawn(async move {
            let result = synthesizer.synthesize(&text, affect, voice.as_deref()).await;
            let _ = tx.send(SynthesisOutcome {
                epoch,
                result,
                interrupt,
            });
        });
    }

    fn handle_synthesis(&mut self, outcome: SynthesisOutcome) {
        if outcome.epoch != self.epoch {
            // The conversation this speech belonged to was reset.
            debug!("discarding synthesis result from a previous session epoch");
            return;
        }
        match outcome.result {
            Ok(speech) => {
                // An idle queue starts the item on enqueue; forcing past the
                // current item only applies when something was playing.
                let was_speaking = self.queue.is_speaking();
                self.queue.enqueue(PlaybackItem {
                    audio: speech.audio,
                    rate: speech.rate,
                });
                if outcome.interrupt && was_speaking {
                    self.queue.play_next(true);
                }
            }
            Err(e) => {
                // Skip the utterance; text interaction is unaffected.
                warn!("synthesis failed, skipping utterance: {e}");
            }
        }
    }

    fn set_loading(&mut self, active: bool) {
        if self.loading != active {
            self.loading = active;
            self.emit(SessionEvent::Loading { active });
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}
