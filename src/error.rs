//! Error types for the session client.

/// Top-level error type for the conversational client.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Responder channel (WebSocket) error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Speech synthesis error (catalog fetch or generation).
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Audio playback error.
    #[error("playback error: {0}")]
    Playback(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SessionError>;
