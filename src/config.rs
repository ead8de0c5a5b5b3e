use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub twilio: TwilioConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    pub stt: SttConfig,
    pub tts: TtsConfig,
    pub agent: AgentConfig,
    #[serde(default)]
    pub greeting: GreetingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Deserialize, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub phone_number: String,
    /// Country code assumed for bare national numbers.
    #[serde(default = "default_country_code")]
    pub default_country_code: String,
}

fn default_country_code() -> String {
    "1".to_string()
}

/// Public base URL for carrier callbacks. When unset the bridge runs in
/// development mode: webhook signatures are not enforced for unsigned
/// requests and stream URLs fall back to the bind address.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct WebhookConfig {
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SttConfig {
    /// One of: deepgram, openai, groq, elevenlabs.
    pub provider: String,
    pub api_key: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Inbound frames buffered before a flush to STT (20 ms each).
    #[serde(default = "default_flush_frames")]
    pub flush_frames: usize,
    /// Idle gap that triggers a batch upload.
    #[serde(default = "default_silence_window_ms")]
    pub silence_window_ms: u64,
    /// Allow the caller to interrupt playback (streaming providers only).
    #[serde(default)]
    pub barge_in: bool,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            provider: "deepgram".to_string(),
            api_key: String::new(),
            language: default_language(),
            model: None,
            flush_frames: default_flush_frames(),
            silence_window_ms: default_silence_window_ms(),
            barge_in: false,
        }
    }
}

fn default_language() -> String {
    "en-US".to_string()
}

fn default_flush_frames() -> usize {
    10
}

fn default_silence_window_ms() -> u64 {
    1500
}

#[derive(Debug, Deserialize, Clone)]
pub struct TtsConfig {
    /// One of: openai, deepgram, elevenlabs.
    pub provider: String,
    pub api_key: String,
    pub voice: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// Base URL of the chat-assistant gateway that answers transcripts.
    pub gateway_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GreetingConfig {
    /// Speak a time-of-day greeting on inbound calls with no explicit one.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_greeting_name")]
    pub name: String,
}

impl Default for GreetingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name: default_greeting_name(),
        }
    }
}

fn default_greeting_name() -> String {
    "Assistant".to_string()
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env from the same directory as config.toml
        let env_path = config_dir().join(".env");
        match dotenvy::from_path(&env_path) {
            Ok(()) => tracing::info!("Loaded .env from {}", env_path.display()),
            Err(dotenvy::Error::Io(_)) => {
                tracing::debug!(
                    "No .env file at {}, using environment only",
                    env_path.display()
                );
            }
            Err(e) => tracing::warn!("Failed to parse .env: {e}"),
        }

        let path = config_path();
        tracing::info!("Loading config from {}", path.display());

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            format!(
                "Failed to read config at {}: {}. Copy config.example.toml to {}",
                path.display(),
                e,
                path.display()
            )
        })?;

        let mut config: Config = toml::from_str(&contents)?;

        // Env var overrides for secrets
        if let Ok(v) = std::env::var("TWILIO_ACCOUNT_SID") {
            config.twilio.account_sid = v;
        }
        if let Ok(v) = std::env::var("TWILIO_AUTH_TOKEN") {
            config.twilio.auth_token = v;
        }
        if let Ok(v) = std::env::var("STT_API_KEY") {
            config.stt.api_key = v;
        }
        if let Ok(v) = std::env::var("TTS_API_KEY") {
            config.tts.api_key = v;
        }
        if let Ok(v) = std::env::var("AGENT_GATEWAY_URL") {
            config.agent.gateway_url = v;
        }
        if let Ok(v) = std::env::var("WEBHOOK_BASE_URL") {
            config.webhook.base_url = Some(v);
        }

        Ok(config)
    }
}

fn config_dir() -> PathBuf {
    if let Ok(p) = std::env::var("VOICE_BRIDGE_CONFIG") {
        // If pointing to a file, use its parent directory
        let path = PathBuf::from(p);
        return path.parent().map(|p| p.to_path_buf()).unwrap_or(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".voice-bridge")
}

fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("VOICE_BRIDGE_CONFIG") {
        return PathBuf::from(p);
    }

    config_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [twilio]
        account_sid = "AC0"
        auth_token = "token"
        phone_number = "+15550000"

        [stt]
        provider = "deepgram"
        api_key = "dg-key"

        [tts]
        provider = "openai"
        api_key = "oa-key"
        voice = "alloy"

        [agent]
        gateway_url = "http://localhost:3000"
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.twilio.default_country_code, "1");
        assert_eq!(config.stt.language, "en-US");
        assert_eq!(config.stt.flush_frames, 10);
        assert_eq!(config.stt.silence_window_ms, 1500);
        assert!(!config.stt.barge_in);
        assert!(config.webhook.base_url.is_none());
        assert!(!config.greeting.enabled);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let raw = format!(
            "{MINIMAL}\n[server]\nhost = \"127.0.0.1\"\nport = 9090\n\n[webhook]\nbase_url = \"https://bridge.example.com\"\n"
        );
        let config: Config = toml::from_str(&raw).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert_eq!(
            config.webhook.base_url.as_deref(),
            Some("https://bridge.example.com")
        );
    }

    #[test]
    fn missing_required_section_fails() {
        let raw = r#"
            [server]
            host = "0.0.0.0"
        "#;
        assert!(toml::from_str::<Config>(raw).is_err());
    }
}
