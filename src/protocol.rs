//! Wire protocol for the responder channel.
//!
//! The responder speaks plain JSON objects, not tagged enums: an outbound
//! message is either a chat turn or a feedback report, and an inbound message
//! carries at most one of `response` / `error` / `streak`.

use serde::{Deserialize, Serialize};

/// Messages sent from the client to the responder.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    /// One user chat turn.
    Chat {
        user_id: String,
        input: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sentiment: Option<String>,
    },
    /// Fire-and-forget rating of a past assistant turn.
    Feedback { feedback: FeedbackPayload },
}

/// Rating of the assistant turn at a given transcript position.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackPayload {
    /// Index of the rated turn in the transcript.
    #[serde(rename = "msgIdx")]
    pub msg_idx: usize,
    /// `1` (helpful) or `-1` (unhelpful).
    pub rating: i8,
}

/// Messages received from the responder.
///
/// Exactly one of `response` / `error` / `streak` is semantically meaningful
/// per message; [`InboundMessage::kind`] resolves which.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub streak: Option<u32>,
    #[serde(default)]
    pub sentiment: Option<SentimentInfo>,
}

/// Emotional-tone signal attached to a response.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SentimentInfo {
    #[serde(default)]
    pub polarity: f32,
}

/// The meaningful payload of an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundKind {
    /// Assistant reply text.
    Response(String),
    /// Responder-reported error, surfaced verbatim in the transcript.
    Error(String),
    /// Running engagement counter; inert with respect to the transcript.
    Streak(u32),
    /// Nothing recognizable; logged and ignored.
    Empty,
}

impl InboundMessage {
    /// Classify the message by its single meaningful field.
    pub fn kind(&self) -> InboundKind {
        if let Some(text) = &self.response {
            InboundKind::Response(text.clone())
        } else if let Some(text) = &self.error {
            InboundKind::Error(text.clone())
        } else if let Some(count) = self.streak {
            InboundKind::Streak(count)
        } else {
            InboundKind::Empty
        }
    }

    /// Affect score of the response; neutral (0) when absent.
    pub fn polarity(&self) -> f32 {
        self.sentiment.map(|s| s.polarity).unwrap_or(0.0)
    }
}
