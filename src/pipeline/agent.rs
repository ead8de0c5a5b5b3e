//! HTTP client for the conversational agent gateway.
//!
//! The bridge's only link to the embedding assistant: each final user
//! transcript is POSTed and the optional `response` field comes back as
//! the text to speak.

use std::time::Duration;

use serde_json::json;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AgentClient {
    url: String,
    client: reqwest::Client,
}

impl AgentClient {
    pub fn new(gateway_url: &str) -> Self {
        Self {
            url: format!(
                "{}/api/voice/message",
                gateway_url.trim_end_matches('/')
            ),
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Forward a caller utterance. `Ok(None)` means the agent chose not
    /// to reply (or returned an unexpected shape, treated the same way).
    pub async fn relay(
        &self,
        call_sid: &str,
        from: &str,
        text: &str,
    ) -> Result<Option<String>, AgentError> {
        let body = json!({
            "call_sid": call_sid,
            "from": from,
            "text": text,
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::Response(format!("HTTP {status}: {body}")));
        }

        let parsed: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AgentError::Parse(e.to_string()))?;

        Ok(parsed
            .get("response")
            .and_then(|v| v.as_str())
            .map(String::from))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent request failed: {0}")]
    Request(String),
    #[error("agent returned error: {0}")]
    Response(String),
    #[error("failed to parse agent response: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_is_built_from_gateway() {
        let client = AgentClient::new("https://gateway.example.com/");
        assert_eq!(client.url, "https://gateway.example.com/api/voice/message");
    }

    #[tokio::test]
    async fn unreachable_gateway_is_a_request_error() {
        let client = AgentClient::new("http://127.0.0.1:9");
        let err = client.relay("CA1", "+15550001", "hello").await.unwrap_err();
        assert!(matches!(err, AgentError::Request(_)));
    }
}
