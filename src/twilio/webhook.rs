//! Carrier-facing HTTP surface: signaling webhooks and the media-stream
//! WebSocket upgrade.
//!
//! Signaling webhooks are signature-checked. The stream upgrade is not:
//! the carrier does not sign media-stream connections.

use std::collections::HashMap;

use axum::extract::{Form, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::twilio::signature;
use crate::AppState;

/// Outcome of checking a webhook's signature against its form body.
fn check_signature(
    base_url: Option<&str>,
    auth_token: &str,
    path: &str,
    params: &[(String, String)],
    header: Option<&str>,
) -> bool {
    match (base_url, header) {
        // Development mode: no public URL configured and the request is
        // unsigned. Anything signed cannot be verified, so reject it.
        (None, None) => true,
        (None, Some(_)) => false,
        (Some(_), None) => false,
        (Some(base), Some(sig)) => {
            let url = format!("{}{}", base.trim_end_matches('/'), path);
            signature::validate(auth_token, &url, params, sig)
        }
    }
}

fn verify(
    state: &AppState,
    path: &str,
    params: &[(String, String)],
    headers: &HeaderMap,
) -> Result<(), Response> {
    let header = headers
        .get(signature::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    if check_signature(
        state.config.webhook.base_url.as_deref(),
        &state.config.twilio.auth_token,
        path,
        params,
        header,
    ) {
        Ok(())
    } else {
        tracing::warn!(path, "Webhook signature rejected");
        Err(StatusCode::FORBIDDEN.into_response())
    }
}

fn to_map(params: Vec<(String, String)>) -> HashMap<String, String> {
    params.into_iter().collect()
}

fn xml(body: String) -> Response {
    ([("Content-Type", "text/xml")], body).into_response()
}

/// POST /voice/inbound — a caller dialed our number.
pub async fn handle_inbound(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(params): Form<Vec<(String, String)>>,
) -> Response {
    if let Err(resp) = verify(&state, "/voice/inbound", &params, &headers) {
        return resp;
    }
    let body = state
        .manager
        .handle_inbound_call(&to_map(params), None)
        .await;
    xml(body)
}

/// POST /voice/status — carrier status transitions for a call.
pub async fn handle_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(params): Form<Vec<(String, String)>>,
) -> Response {
    if let Err(resp) = verify(&state, "/voice/status", &params, &headers) {
        return resp;
    }
    state.manager.handle_status_callback(&to_map(params)).await;
    StatusCode::OK.into_response()
}

/// POST /voice/gather — speech/digits from the carrier's own recognizer.
pub async fn handle_gather(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(params): Form<Vec<(String, String)>>,
) -> Response {
    if let Err(resp) = verify(&state, "/voice/gather", &params, &headers) {
        return resp;
    }
    let body = state.manager.handle_gather_callback(&to_map(params)).await;
    xml(body)
}

/// GET /voice/stream — media-stream WebSocket upgrade.
pub async fn handle_stream_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| state.manager.clone().handle_media_stream(socket))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "auth-token";
    const BASE: &str = "https://bridge.example.com";

    fn params() -> Vec<(String, String)> {
        vec![
            ("CallSid".to_string(), "CA1".to_string()),
            ("CallStatus".to_string(), "completed".to_string()),
        ]
    }

    fn sign(path: &str, params: &[(String, String)]) -> String {
        signature::compute(TOKEN, &format!("{BASE}{path}"), params)
    }

    #[test]
    fn valid_signature_passes() {
        let sig = sign("/voice/status", &params());
        assert!(check_signature(
            Some(BASE),
            TOKEN,
            "/voice/status",
            &params(),
            Some(&sig)
        ));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let sig = sign("/voice/status", &params());
        let mut tampered = params();
        tampered[1].1 = "failed".to_string();
        assert!(!check_signature(
            Some(BASE),
            TOKEN,
            "/voice/status",
            &tampered,
            Some(&sig)
        ));
    }

    #[test]
    fn missing_signature_is_rejected_when_configured() {
        assert!(!check_signature(
            Some(BASE),
            TOKEN,
            "/voice/status",
            &params(),
            None
        ));
    }

    #[test]
    fn development_mode_allows_unsigned_requests() {
        assert!(check_signature(None, TOKEN, "/voice/status", &params(), None));
    }

    #[test]
    fn development_mode_rejects_signed_requests() {
        let sig = sign("/voice/status", &params());
        assert!(!check_signature(
            None,
            TOKEN,
            "/voice/status",
            &params(),
            Some(&sig)
        ));
    }
}

#[cfg(test)]
mod router_tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use crate::call::SignalingState;
    use crate::config::{
        AgentConfig, Config, GreetingConfig, ServerConfig, SttConfig, TtsConfig, TwilioConfig,
        WebhookConfig,
    };
    use crate::manager::CallManager;
    use crate::pipeline::tts::TtsClient;
    use crate::twilio::client::TwilioClient;
    use crate::twilio::signature;
    use crate::AppState;

    const BASE: &str = "https://bridge.example.com";
    const TOKEN: &str = "auth-token";

    fn test_state() -> AppState {
        let config = Config {
            server: ServerConfig::default(),
            twilio: TwilioConfig {
                account_sid: "AC0".to_string(),
                auth_token: TOKEN.to_string(),
                phone_number: "+15550000".to_string(),
                default_country_code: "1".to_string(),
            },
            webhook: WebhookConfig {
                base_url: Some(BASE.to_string()),
            },
            stt: SttConfig::default(),
            tts: TtsConfig {
                provider: "openai".to_string(),
                api_key: "key".to_string(),
                voice: "alloy".to_string(),
                model: None,
            },
            agent: AgentConfig {
                gateway_url: "http://localhost:3000".to_string(),
            },
            greeting: GreetingConfig::default(),
        };
        let twilio = Arc::new(TwilioClient::new(&config.twilio));
        let tts = Arc::new(TtsClient::new(&config.tts).unwrap());
        let (events_tx, _events_rx) = mpsc::channel(16);
        let manager = Arc::new(CallManager::new(config.clone(), twilio, tts, events_tx));
        AppState { config, manager }
    }

    fn signed_request(path: &str, params: &[(&str, &str)]) -> Request<Body> {
        let owned: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let sig = signature::compute(TOKEN, &format!("{BASE}{path}"), &owned);

        let body: String = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencode(v)))
            .collect::<Vec<_>>()
            .join("&");

        Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header("X-Twilio-Signature", sig)
            .body(Body::from(body))
            .unwrap()
    }

    fn urlencode(s: &str) -> String {
        s.bytes()
            .map(|b| match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    String::from(b as char)
                }
                _ => format!("%{b:02X}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn status_webhook_with_bad_signature_is_403_without_side_effects() {
        let state = test_state();
        let app = crate::router(state.clone());

        let request = Request::builder()
            .method("POST")
            .uri("/voice/status")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header("X-Twilio-Signature", "aW52YWxpZCBzaWduYXR1cmU=")
            .body(Body::from("CallSid=CA1&CallStatus=completed"))
            .unwrap();

        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(state.manager.get_record("CA1").await.is_none());
    }

    #[tokio::test]
    async fn status_webhook_with_valid_signature_reconciles_state() {
        let state = test_state();
        let app = crate::router(state.clone());

        let request = signed_request(
            "/voice/status",
            &[
                ("CallSid", "CA1"),
                ("CallStatus", "completed"),
                ("From", "+15550001"),
                ("To", "+15559999"),
                ("AccountSid", "AC0"),
            ],
        );

        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let record = state.manager.get_record("CA1").await.unwrap();
        assert_eq!(record.signaling, SignalingState::Completed);
        assert!(record.ended_at.is_some());
    }

    #[tokio::test]
    async fn inbound_webhook_returns_stream_twiml() {
        let state = test_state();
        let app = crate::router(state.clone());

        let request = signed_request(
            "/voice/inbound",
            &[
                ("CallSid", "CA1"),
                ("From", "+15550001"),
                ("To", "+15559999"),
                ("AccountSid", "AC0"),
            ],
        );

        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .unwrap();
        let xml = String::from_utf8(body.to_vec()).unwrap();
        assert!(xml.contains(
            r#"<Connect><Stream url="wss://bridge.example.com/voice/stream" track="inbound_track"/></Connect>"#
        ));

        let record = state.manager.get_record("CA1").await.unwrap();
        assert_eq!(record.from, "+15550001");
        assert_eq!(record.signaling, SignalingState::InProgress);
    }

    #[tokio::test]
    async fn gather_webhook_returns_gather_loop() {
        let state = test_state();
        let app = crate::router(state.clone());

        let request = signed_request(
            "/voice/gather",
            &[("CallSid", "CA1"), ("SpeechResult", "hello there")],
        );

        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .unwrap();
        let xml = String::from_utf8(body.to_vec()).unwrap();
        assert!(xml.contains(r#"action="https://bridge.example.com/voice/gather""#));

        let record = state.manager.get_record("CA1").await.unwrap();
        assert_eq!(record.transcript.len(), 1);
        assert_eq!(record.transcript[0].text, "hello there");
    }
}
