//! Configuration types for the conversational client.

use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Responder channel settings.
    pub connection: ConnectionConfig,
    /// Speech synthesis settings.
    pub synthesis: SynthesisConfig,
    /// Speech playback settings.
    pub speech: SpeechConfig,
}

/// Responder channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// WebSocket URL of the remote responder.
    pub url: String,
    /// Identifier sent with every chat turn.
    pub user_id: String,
    /// Delay between reconnection attempts in ms.
    ///
    /// The reconnect policy is a fixed delay repeated indefinitely — no
    /// backoff growth and no retry cap. The session is long-lived and
    /// interactive, so it keeps trying until the responder comes back.
    pub reconnect_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8001/ws".to_owned(),
            user_id: "user1".to_owned(),
            reconnect_delay_ms: 3_000,
        }
    }
}

/// Speech synthesis service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Base URL of the synthesis service.
    pub api_url: String,
    /// API key. When absent, `MIRA_SYNTHESIS_API_KEY` is consulted at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Voice used when no explicit selection was made and the catalog is empty.
    pub fallback_voice_id: String,
    /// Fixed similarity boost sent with every synthesis request.
    pub similarity_boost: f32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.elevenlabs.io".to_owned(),
            api_key: None,
            // Rachel — a sensible default when the catalog cannot be fetched.
            fallback_voice_id: "21m00Tcm4TlvDq8ikWAM".to_owned(),
            similarity_boost: 0.75,
        }
    }
}

/// Speech playback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Whether assistant replies are spoken automatically.
    pub enabled: bool,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Environment variable consulted when `synthesis.api_key` is unset.
pub const API_KEY_ENV: &str = "MIRA_SYNTHESIS_API_KEY";

impl ClientConfig {
    /// Default config file path (`<config dir>/mira/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("mira").join("config.toml"))
    }

    /// Load config from a toml file. Missing sections fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| SessionError::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Load from the default path, falling back to defaults when no file exists.
    ///
    /// # Errors
    ///
    /// Returns an error only if a file exists but cannot be parsed.
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Write config to a toml file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)
            .map_err(|e| SessionError::Config(format!("cannot serialize config: {e}")))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Resolve the synthesis API key: explicit config value, else environment.
    pub fn synthesis_api_key(&self) -> Option<String> {
        self.synthesis
            .api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|k| !k.trim().is_empty())
    }
}
