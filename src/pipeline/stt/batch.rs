//! Batch STT: buffer inbound PCM, wrap it in a WAV container and POST it
//! to a Whisper-style transcription endpoint once the caller pauses.
//!
//! An idle-silence timer (default 1.5 s) and a hard buffer cap (~5 s of
//! 16 kHz audio) bound the latency; clips shorter than the minimum or
//! quieter than the energy gate are dropped instead of uploaded.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{SttError, SttEvent};
use crate::config::SttConfig;
use crate::pipeline::audio;

/// Hard cap before a forced upload: ~5 s at 16 kHz, 16-bit mono.
const BUFFER_CAP_BYTES: usize = 160_000;
/// Below this the clip is too short to transcribe (~0.2 s).
const MIN_AUDIO_BYTES: usize = 6_400;
/// RMS gate: quieter buffers are ambient noise, not speech.
const MIN_RMS_ENERGY: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchProvider {
    OpenAi,
    Groq,
    ElevenLabs,
}

impl BatchProvider {
    fn endpoint(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1/audio/transcriptions",
            Self::Groq => "https://api.groq.com/openai/v1/audio/transcriptions",
            Self::ElevenLabs => "https://api.elevenlabs.io/v1/speech-to-text",
        }
    }

    fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "whisper-1",
            Self::Groq => "whisper-large-v3-turbo",
            Self::ElevenLabs => "scribe_v1",
        }
    }
}

enum Cmd {
    Connect,
    Audio(Bytes),
    Clear,
    Finalize,
    Disconnect,
}

/// Handle to one buffered batch-STT session.
pub struct BatchStt {
    cmd: mpsc::Sender<Cmd>,
}

impl BatchStt {
    pub fn spawn(
        provider: BatchProvider,
        config: &SttConfig,
        language: String,
        events: mpsc::Sender<SttEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let actor = Actor {
            provider,
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| provider.default_model().to_string()),
            language,
            silence_window: Duration::from_millis(config.silence_window_ms),
            events,
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd: cmd_tx }
    }

    pub async fn connect(&self) {
        let _ = self.cmd.send(Cmd::Connect).await;
    }

    pub async fn send(&self, pcm: Bytes) {
        let _ = self.cmd.send(Cmd::Audio(pcm)).await;
    }

    pub async fn clear_buffer(&self) {
        let _ = self.cmd.send(Cmd::Clear).await;
    }

    pub async fn finalize(&self) {
        let _ = self.cmd.send(Cmd::Finalize).await;
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd.send(Cmd::Disconnect).await;
    }
}

struct Actor {
    provider: BatchProvider,
    client: reqwest::Client,
    api_key: String,
    model: String,
    language: String,
    silence_window: Duration,
    events: mpsc::Sender<SttEvent>,
}

impl Actor {
    async fn run(self, mut cmd_rx: mpsc::Receiver<Cmd>) {
        let mut buffer: Vec<u8> = Vec::new();
        let idle = tokio::time::sleep(self.silence_window);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        // No backing connection to establish.
                        Some(Cmd::Connect) => {
                            let _ = self.events.send(SttEvent::Connected).await;
                        }
                        Some(Cmd::Audio(pcm)) => {
                            buffer.extend_from_slice(&pcm);
                            idle.as_mut().reset(Instant::now() + self.silence_window);
                            if buffer.len() >= BUFFER_CAP_BYTES {
                                self.flush(&mut buffer).await;
                            }
                        }
                        Some(Cmd::Clear) => buffer.clear(),
                        Some(Cmd::Finalize) => {
                            self.flush(&mut buffer).await;
                            break;
                        }
                        Some(Cmd::Disconnect) | None => break,
                    }
                }

                () = &mut idle, if !buffer.is_empty() => {
                    self.flush(&mut buffer).await;
                    idle.as_mut().reset(Instant::now() + self.silence_window);
                }
            }
        }

        let _ = self.events.send(SttEvent::Disconnected).await;
    }

    /// Upload the buffered audio as WAV and emit the transcript.
    async fn flush(&self, buffer: &mut Vec<u8>) {
        let bytes = std::mem::take(buffer);
        if bytes.len() < MIN_AUDIO_BYTES {
            tracing::debug!(len = bytes.len(), "Dropping sub-minimum audio clip");
            return;
        }

        let samples = audio::pcm_bytes_to_samples(&bytes);
        let energy = audio::rms_energy(&samples);
        if energy < MIN_RMS_ENERGY {
            tracing::debug!(energy = format!("{energy:.1}"), "Dropping silent clip");
            return;
        }

        match self.transcribe(&samples).await {
            Ok(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return;
                }
                if is_whisper_hallucination(trimmed) {
                    tracing::debug!(transcript = %trimmed, "Filtered hallucination");
                    return;
                }
                let _ = self
                    .events
                    .send(SttEvent::Transcript {
                        text: trimmed.to_string(),
                        confidence: None,
                        is_final: true,
                    })
                    .await;
            }
            Err(e) => {
                tracing::warn!("Transcription failed: {e}");
                let _ = self.events.send(SttEvent::Error(e.to_string())).await;
            }
        }
    }

    async fn transcribe(&self, samples: &[i16]) -> Result<String, SttError> {
        let wav = audio::pcm_to_wav(samples, audio::STT_SAMPLE_RATE)
            .map_err(|e| SttError::Request(e.to_string()))?;

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| SttError::Request(e.to_string()))?;

        let mut request = self.client.post(self.provider.endpoint());
        let form = match self.provider {
            BatchProvider::OpenAi | BatchProvider::Groq => {
                request = request.bearer_auth(&self.api_key);
                reqwest::multipart::Form::new()
                    .part("file", part)
                    .text("model", self.model.clone())
                    .text("language", self.language.clone())
                    .text("response_format", "json")
            }
            BatchProvider::ElevenLabs => {
                request = request.header("xi-api-key", &self.api_key);
                reqwest::multipart::Form::new()
                    .part("file", part)
                    .text("model_id", self.model.clone())
                    .text("language_code", self.language.clone())
            }
        };

        let resp = request
            .multipart(form)
            .send()
            .await
            .map_err(|e| SttError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SttError::Api(format!("{status}: {body}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SttError::Request(e.to_string()))?;

        Ok(body
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }
}

/// Known Whisper hallucinations — phrases it generates from silence/noise.
const WHISPER_HALLUCINATIONS: &[&str] = &[
    "thank you",
    "thank you.",
    "thanks for watching",
    "thanks for watching.",
    "thank you for watching",
    "thank you for watching.",
    "subscribe",
    "like and subscribe",
    "bye",
    "bye.",
    "bye bye",
    "bye bye.",
    "you",
    "you.",
    "the end",
    "the end.",
    "so",
    "...",
    "eh",
    "hmm",
    "uh",
    "oh",
];

fn is_whisper_hallucination(transcript: &str) -> bool {
    let lower = transcript.to_lowercase();
    WHISPER_HALLUCINATIONS.iter().any(|h| lower == *h)
}
