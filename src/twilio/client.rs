//! Twilio REST API client: create calls and update live ones.

use crate::config::TwilioConfig;

const API_BASE: &str = "https://api.twilio.com/2010-04-01";

/// Thin client over the carrier's Calls resource.
pub struct TwilioClient {
    client: reqwest::Client,
    base_url: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

/// The subset of the Calls.json response we act on.
#[derive(Debug, serde::Deserialize)]
pub struct CallCreated {
    pub sid: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl TwilioClient {
    pub fn new(config: &TwilioConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: API_BASE.to_string(),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from_number: config.phone_number.clone(),
        }
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    pub fn from_number(&self) -> &str {
        &self.from_number
    }

    /// Place an outbound call whose behavior is given by inline TwiML.
    /// The status callback keeps signaling transitions flowing back to us.
    pub async fn create_call(
        &self,
        to: &str,
        twiml: &str,
        status_callback: Option<&str>,
    ) -> Result<CallCreated, TwilioError> {
        let url = format!("{}/Accounts/{}/Calls.json", self.base_url, self.account_sid);

        let mut params = vec![
            ("To", to),
            ("From", self.from_number.as_str()),
            ("Twiml", twiml),
        ];
        if let Some(callback) = status_callback {
            params.push(("StatusCallback", callback));
            params.push(("StatusCallbackMethod", "POST"));
        }

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| TwilioError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TwilioError::Api(format!("{status}: {body}")));
        }

        let created: CallCreated = resp
            .json()
            .await
            .map_err(|e| TwilioError::Request(e.to_string()))?;

        tracing::info!(to, call_sid = %created.sid, "Outbound call created");
        Ok(created)
    }

    /// Redirect a live call to new inline TwiML (used for the `<Say>`
    /// fallback when local synthesis is unavailable).
    pub async fn update_call_twiml(&self, call_sid: &str, twiml: &str) -> Result<(), TwilioError> {
        self.update_call(call_sid, &[("Twiml", twiml)]).await
    }

    /// Ask the carrier to hang up a live call.
    pub async fn complete_call(&self, call_sid: &str) -> Result<(), TwilioError> {
        self.update_call(call_sid, &[("Status", "completed")]).await
    }

    async fn update_call(
        &self,
        call_sid: &str,
        params: &[(&str, &str)],
    ) -> Result<(), TwilioError> {
        let url = format!(
            "{}/Accounts/{}/Calls/{}.json",
            self.base_url, self.account_sid, call_sid
        );

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(params)
            .send()
            .await
            .map_err(|e| TwilioError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TwilioError::Api(format!("{status}: {body}")));
        }

        tracing::debug!(call_sid, "Call updated");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TwilioError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("Twilio API error: {0}")]
    Api(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TwilioConfig;

    fn test_config() -> TwilioConfig {
        TwilioConfig {
            account_sid: "AC0".to_string(),
            auth_token: "token".to_string(),
            phone_number: "+15550000".to_string(),
            default_country_code: "1".to_string(),
        }
    }

    #[tokio::test]
    async fn create_call_rejects_unreachable_api() {
        // Port 9 is discard; connection will fail fast and surface as Request.
        let client = TwilioClient::new(&test_config()).with_base_url("http://127.0.0.1:9");
        let err = client
            .create_call("+15551234567", "<Response/>", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TwilioError::Request(_)));
    }
}
