//! Text-to-speech providers.
//!
//! One stateless client shared by every call; the only state is the
//! underlying HTTP connection pool. All providers normalize to 16-bit
//! little-endian mono PCM at 24 kHz, which [`synthesize_all_for_twilio`]
//! reframes as 8 kHz mu-law for the carrier.
//!
//! [`synthesize_all_for_twilio`]: TtsClient::synthesize_all_for_twilio

use crate::config::TtsConfig;
use crate::pipeline::audio;

/// Sample rate every provider normalizes to.
pub const TTS_SAMPLE_RATE: u32 = 24000;

/// Trailing silence appended to ElevenLabs output to avoid clipped
/// utterance endings: 200 ms at 24 kHz, 16-bit.
const TRAILING_SILENCE_BYTES: usize = 9_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provider {
    OpenAi,
    Deepgram,
    ElevenLabs,
}

pub struct TtsClient {
    provider: Provider,
    client: reqwest::Client,
    api_key: String,
    voice: String,
    model: String,
}

impl TtsClient {
    pub fn new(config: &TtsConfig) -> Result<Self, TtsError> {
        let provider = match config.provider.as_str() {
            "openai" => Provider::OpenAi,
            "deepgram" => Provider::Deepgram,
            "elevenlabs" => Provider::ElevenLabs,
            other => return Err(TtsError::UnknownProvider(other.to_string())),
        };

        let model = config.model.clone().unwrap_or_else(|| {
            match provider {
                Provider::OpenAi => "tts-1",
                Provider::Deepgram => "aura-2-thalia-en",
                Provider::ElevenLabs => "eleven_turbo_v2_5",
            }
            .to_string()
        });

        Ok(Self {
            provider,
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            voice: config.voice.clone(),
            model,
        })
    }

    /// Synthesize to 24 kHz 16-bit little-endian mono PCM.
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>, TtsError> {
        match self.provider {
            Provider::OpenAi => self.synthesize_openai(text).await,
            Provider::Deepgram => self.synthesize_deepgram(text).await,
            Provider::ElevenLabs => self.synthesize_elevenlabs(text).await,
        }
    }

    /// Synthesize and yield carrier-ready 160-byte mu-law frames lazily.
    #[allow(dead_code)]
    pub async fn synthesize_for_twilio(
        &self,
        text: &str,
    ) -> Result<impl Iterator<Item = Vec<u8>>, TtsError> {
        Ok(self.synthesize_all_for_twilio(text).await?.into_iter())
    }

    /// Synthesize and materialize the full frame sequence, for when the
    /// whole utterance is enqueued before playback.
    pub async fn synthesize_all_for_twilio(&self, text: &str) -> Result<Vec<Vec<u8>>, TtsError> {
        let pcm = self.synthesize(text).await?;
        Ok(audio::convert_to_twilio(&pcm, TTS_SAMPLE_RATE))
    }

    async fn synthesize_openai(&self, text: &str) -> Result<Vec<u8>, TtsError> {
        // `pcm` response format is 24 kHz 16-bit LE mono.
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "response_format": "pcm",
        });

        let resp = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;

        Self::read_audio(resp).await
    }

    async fn synthesize_deepgram(&self, text: &str) -> Result<Vec<u8>, TtsError> {
        let url = format!(
            "https://api.deepgram.com/v1/speak?model={}&encoding=linear16&sample_rate={}&container=none",
            self.model, TTS_SAMPLE_RATE
        );

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key))
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;

        Self::read_audio(resp).await
    }

    async fn synthesize_elevenlabs(&self, text: &str) -> Result<Vec<u8>, TtsError> {
        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}?output_format=pcm_24000",
            self.voice
        );

        let body = serde_json::json!({
            "text": text,
            "model_id": self.model,
            "voice_settings": {
                "stability": 0.5,
                "similarity_boost": 0.75
            }
        });

        let resp = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;

        let mut pcm = Self::read_audio(resp).await?;
        // ElevenLabs tends to cut the final phoneme without padding.
        pcm.extend(std::iter::repeat(0u8).take(TRAILING_SILENCE_BYTES));
        Ok(pcm)
    }

    async fn read_audio(resp: reqwest::Response) -> Result<Vec<u8>, TtsError> {
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TtsError::Api(format!("{status}: {body}")));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TtsError {
    #[error("unknown TTS provider: {0}")]
    UnknownProvider(String),
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("API error: {0}")]
    Api(String),
}
