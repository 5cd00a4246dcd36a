//! Request-to-audio cache keyed by exact response text.

use bytes::Bytes;
use std::collections::HashMap;

/// Cache of previously synthesized utterances.
///
/// Keys are the exact response text — affect and voice are deliberately not
/// part of the key, so two requests for the same text with different affect
/// reuse the first rendering. This matches observed behavior and is an
/// accepted approximation, not something to fix silently.
///
/// Entries live for the session with no eviction; a known limitation for
/// short-lived interactive sessions.
#[derive(Debug, Default)]
pub struct AudioCache {
    entries: HashMap<String, Bytes>,
}

impl AudioCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exact-match lookup. No fuzzy or partial matching.
    pub fn get(&self, text: &str) -> Option<Bytes> {
        self.entries.get(text).cloned()
    }

    /// Store a rendering. An existing entry for the same text is kept as-is.
    pub fn insert(&mut self, text: impl Into<String>, audio: Bytes) {
        self.entries.entry(text.into()).or_insert(audio);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
