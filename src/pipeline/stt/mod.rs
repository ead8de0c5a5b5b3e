//! Streaming speech-to-text with pluggable providers.
//!
//! The manager holds an [`SttSession`] without knowing which provider is
//! inside; events arrive on an mpsc channel. Deepgram streams over a
//! WebSocket; OpenAI, Groq and ElevenLabs transcribe buffered WAV uploads.

pub mod batch;
pub mod deepgram;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::SttConfig;

/// Events emitted by an STT session.
#[derive(Debug, Clone)]
pub enum SttEvent {
    /// Backing session is ready.
    Connected,
    /// A transcription result. `is_final` distinguishes interim updates.
    Transcript {
        text: String,
        confidence: Option<f64>,
        is_final: bool,
    },
    /// Provider-side voice activity detection fired (streaming only).
    SpeechStarted,
    /// The session is gone and will emit nothing further.
    Disconnected,
    /// A recoverable provider error; the call continues untranscribed.
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SttError {
    #[error("unknown STT provider: {0}")]
    UnknownProvider(String),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("API error: {0}")]
    Api(String),
}

/// A per-call speech-to-text session.
///
/// Variant dispatch keeps the call sites free of provider details, the
/// same shape the bridge uses elsewhere for pluggable backends.
pub enum SttSession {
    Deepgram(deepgram::DeepgramStt),
    Batch(batch::BatchStt),
}

impl SttSession {
    /// Build a session for the configured provider. The receiver carries
    /// every event the session will ever emit.
    pub fn create(config: &SttConfig) -> Result<(Self, mpsc::Receiver<SttEvent>), SttError> {
        let (events_tx, events_rx) = mpsc::channel(64);
        let language = normalize_language(&config.language);

        let session = match config.provider.as_str() {
            "deepgram" => Self::Deepgram(deepgram::DeepgramStt::spawn(
                config.api_key.clone(),
                language,
                events_tx,
            )),
            "openai" => Self::Batch(batch::BatchStt::spawn(
                batch::BatchProvider::OpenAi,
                config,
                language,
                events_tx,
            )),
            "groq" => Self::Batch(batch::BatchStt::spawn(
                batch::BatchProvider::Groq,
                config,
                language,
                events_tx,
            )),
            "elevenlabs" => Self::Batch(batch::BatchStt::spawn(
                batch::BatchProvider::ElevenLabs,
                config,
                language,
                events_tx,
            )),
            other => return Err(SttError::UnknownProvider(other.to_string())),
        };

        Ok((session, events_rx))
    }

    /// Establish the backing session. Idempotent; success or failure is
    /// reported through the event channel.
    pub async fn connect(&self) {
        match self {
            Self::Deepgram(s) => s.connect().await,
            Self::Batch(s) => s.connect().await,
        }
    }

    /// Submit 16 kHz, 16-bit little-endian mono PCM.
    pub async fn send(&self, pcm: Bytes) {
        match self {
            Self::Deepgram(s) => s.send(pcm).await,
            Self::Batch(s) => s.send(pcm).await,
        }
    }

    /// Discard any internally buffered audio.
    pub async fn clear_buffer(&self) {
        match self {
            Self::Deepgram(s) => s.clear_buffer().await,
            Self::Batch(s) => s.clear_buffer().await,
        }
    }

    /// Flush buffered audio and close cleanly; a final transcript may
    /// still be emitted before `Disconnected`.
    #[allow(dead_code)]
    pub async fn finalize(&self) {
        match self {
            Self::Deepgram(s) => s.finalize().await,
            Self::Batch(s) => s.finalize().await,
        }
    }

    /// Tear down unconditionally; pending buffers are discarded.
    pub async fn disconnect(&self) {
        match self {
            Self::Deepgram(s) => s.disconnect().await,
            Self::Batch(s) => s.disconnect().await,
        }
    }

    /// Whether the provider emits `SpeechStarted` fast enough for the
    /// manager to interrupt playback.
    pub fn supports_barge_in(&self) -> bool {
        matches!(self, Self::Deepgram(_))
    }
}

/// Normalize a language tag to ISO 639-1 two-letter form.
pub fn normalize_language(code: &str) -> String {
    let primary = code.split(['-', '_']).next().unwrap_or(code);
    let lower = primary.to_ascii_lowercase();
    match lower.as_str() {
        "eng" => "en".to_string(),
        "spa" => "es".to_string(),
        "fra" | "fre" => "fr".to_string(),
        "deu" | "ger" => "de".to_string(),
        "ita" => "it".to_string(),
        "por" => "pt".to_string(),
        "nld" | "dut" => "nl".to_string(),
        "jpn" => "ja".to_string(),
        "zho" | "chi" => "zh".to_string(),
        _ if lower.len() <= 2 => lower,
        _ => lower[..2].to_string(),
    }
}
