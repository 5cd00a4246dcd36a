//! Ordered conversation history with in-flight assistant replacement.
//!
//! Turns are immutable once appended, with one exception: the single
//! "in-flight" assistant turn — a reply still subject to revision — may be
//! replaced in place while it is the last element. At most one in-flight
//! turn exists at a time.

use chrono::{DateTime, Utc};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

/// One message in the transcript.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// Capture time of the turn.
    pub timestamp: DateTime<Utc>,
}

/// Append-only conversation history.
///
/// Never persisted; lives for the session and is cleared wholesale on
/// new-chat.
#[derive(Debug, Default)]
pub struct Transcript {
    turns: Vec<Turn>,
    /// Whether the last turn is an in-flight assistant turn.
    in_flight: bool,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn get(&self, idx: usize) -> Option<&Turn> {
        self.turns.get(idx)
    }

    /// Whether the last turn may still be replaced.
    pub fn has_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Append a user turn. Any in-flight assistant turn becomes final.
    pub fn push_user(&mut self, content: impl Into<String>) {
        self.in_flight = false;
        self.turns.push(Turn {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    /// Record an assistant reply.
    ///
    /// Replaces the in-flight assistant turn when one exists (a response
    /// arriving in parts revises the same turn); otherwise appends a new
    /// turn and marks it in-flight.
    pub fn push_assistant(&mut self, content: impl Into<String>) {
        let turn = Turn {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        };
        if self.in_flight {
            if let Some(last) = self.turns.last_mut() {
                *last = turn;
                return;
            }
        }
        self.turns.push(turn);
        self.in_flight = true;
    }

    /// Drop all turns.
    pub fn clear(&mut self) {
        self.turns.clear();
        self.in_flight = false;
    }
}
