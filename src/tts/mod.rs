//! Speech synthesis client.
//!
//! Converts assistant reply text into playable audio via an ElevenLabs-style
//! HTTP service, consulting the [`AudioCache`] first so no text is ever
//! synthesized twice. Affect biases the voice parameters: positive affect
//! lowers stability and speeds playback up, neutral or negative affect does
//! the opposite.

mod cache;

pub use cache::AudioCache;

use crate::error::{Result, SessionError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// One entry of the synthesis service's voice catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceDescriptor {
    pub voice_id: String,
    pub name: String,
    /// Locale/accent metadata, e.g. `accent`, `gender`.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct VoiceCatalog {
    #[serde(default)]
    voices: Vec<VoiceDescriptor>,
}

/// Parameters sent with a synthesis request.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
}

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
    voice_settings: VoiceSettings,
}

/// A playable utterance: opaque audio plus the rate it should play at.
#[derive(Debug, Clone)]
pub struct SynthesizedSpeech {
    pub audio: Bytes,
    /// Playback rate; >1.0 is faster than recorded.
    pub rate: f32,
}

/// Map an affect score to voice parameters.
///
/// Higher positive affect maps to lower stability and faster playback;
/// neutral or negative affect to higher stability and slower playback.
/// Returns `(stability, rate)`.
pub fn affect_parameters(affect: f32) -> (f32, f32) {
    if affect > 0.0 { (0.7, 1.1) } else { (0.9, 0.9) }
}

/// Text-to-audio conversion seam.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text`, biased by `affect`, using `voice` when given.
    ///
    /// # Errors
    ///
    /// Returns an error when the service rejects the request or the
    /// transport fails; the cache is left unmodified in that case.
    async fn synthesize(
        &self,
        text: &str,
        affect: f32,
        voice: Option<&str>,
    ) -> Result<SynthesizedSpeech>;

    /// Fetch the voice catalog.
    ///
    /// # Errors
    ///
    /// Returns an error when the catalog cannot be retrieved; the caller's
    /// fallback is to disable speech for the session.
    async fn fetch_voices(&self) -> Result<Vec<VoiceDescriptor>>;
}

/// HTTP client for an ElevenLabs-style synthesis service.
pub struct ElevenLabsClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    similarity_boost: f32,
    fallback_voice_id: String,
    cache: Mutex<AudioCache>,
    /// Catalog snapshot from the last successful fetch, used for the
    /// first-available-voice fallback.
    catalog: RwLock<Vec<VoiceDescriptor>>,
}

impl ElevenLabsClient {
    pub fn new(config: &crate::config::SynthesisConfig, api_key: Option<String>) -> Self {
        if api_key.is_none() {
            warn!("no synthesis API key configured; synthesis requests will fail");
        }
        Self {
            http: reqwest::Client::new(),
            base_url: config.api_url.trim_end_matches('/').to_owned(),
            api_key,
            similarity_boost: config.similarity_boost,
            fallback_voice_id: config.fallback_voice_id.clone(),
            cache: Mutex::new(AudioCache::new()),
            catalog: RwLock::new(Vec::new()),
        }
    }

    /// Resolve the voice to synthesize with: explicit selection, else the
    /// first catalog entry, else the hard-coded default.
    fn resolve_voice_id(&self, voice: Option<&str>) -> String {
        if let Some(id) = voice {
            return id.to_owned();
        }
        let catalog = match self.catalog.read() {
            Ok(c) => c,
            Err(p) => p.into_inner(),
        };
        catalog
            .first()
            .map(|v| v.voice_id.clone())
            .unwrap_or_else(|| self.fallback_voice_id.clone())
    }

    fn cached(&self, text: &str) -> Option<Bytes> {
        match self.cache.lock() {
            Ok(c) => c.get(text),
            Err(p) => p.into_inner().get(text),
        }
    }

    fn store(&self, text: &str, audio: Bytes) {
        match self.cache.lock() {
            Ok(mut c) => c.insert(text, audio),
            Err(p) => p.into_inner().insert(text, audio),
        }
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| SessionError::Synthesis("synthesis API key not configured".into()))
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsClient {
    async fn synthesize(
        &self,
        text: &str,
        affect: f32,
        voice: Option<&str>,
    ) -> Result<SynthesizedSpeech> {
        let (stability, rate) = affect_parameters(affect);

        // Cache first — a hit never touches the network, whatever the affect.
        if let Some(audio) = self.cached(text) {
            debug!("synthesis cache hit ({} bytes)", audio.len());
            return Ok(SynthesizedSpeech { audio, rate });
        }

        let api_key = self.api_key()?;
        let voice_id = self.resolve_voice_id(voice);
        let payload = SynthesisRequest {
            text,
            voice_settings: VoiceSettings {
                stability,
                similarity_boost: self.similarity_boost,
            },
        };

        let response = self
            .http
            .post(format!("{}/v1/text-to-speech/{voice_id}", self.base_url))
            .header("Accept", "audio/mpeg")
            .header("xi-api-key", api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SessionError::Synthesis(format!("synthesis request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SessionError::Synthesis(format!(
                "synthesis service returned {status}: {body}"
            )));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| SessionError::Synthesis(format!("cannot read audio body: {e}")))?;

        info!("synthesized {} chars → {} bytes", text.len(), audio.len());
        self.store(text, audio.clone());
        Ok(SynthesizedSpeech { audio, rate })
    }

    async fn fetch_voices(&self) -> Result<Vec<VoiceDescriptor>> {
        let api_key = self.api_key()?;

        let response = self
            .http
            .get(format!("{}/v1/voices", self.base_url))
            .header("xi-api-key", api_key)
            .send()
            .await
            .map_err(|e| SessionError::Synthesis(format!("catalog fetch failed: {e}")))?;

        if !response.status().is_success() {
            return Err(SessionError::Synthesis(format!(
                "catalog fetch returned {}",
                response.status()
            )));
        }

        let catalog: VoiceCatalog = response
            .json()
            .await
            .map_err(|e| SessionError::Synthesis(format!("cannot parse voice catalog: {e}")))?;

        info!("voice catalog loaded: {} voices", catalog.voices.len());
        match self.catalog.write() {
            Ok(mut c) => *c = catalog.voices.clone(),
            Err(p) => *p.into_inner() = catalog.voices.clone(),
        }
        Ok(catalog.voices)
    }
}
