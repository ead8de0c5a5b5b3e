//! REST control API: place calls, speak into them, end them, inspect
//! records.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::manager::BridgeError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CallRequest {
    /// Phone number to call; normalized to E.164 by the manager.
    pub to: String,
    /// Play this message and hang up (one-shot call).
    pub message: Option<String>,
    /// Speak this greeting when the media stream attaches.
    pub greeting: Option<String>,
    /// Open a conversational call even without a greeting.
    #[serde(default)]
    pub conversation: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    pub success: bool,
    pub call_sid: String,
    pub state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakRequest {
    pub call_sid: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndRequest {
    pub call_sid: String,
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
struct OkResponse {
    success: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    active_calls: usize,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn bridge_error(e: BridgeError) -> Response {
    match e {
        BridgeError::UnknownCall(_) => error(StatusCode::NOT_FOUND, e.to_string()),
        BridgeError::Twilio(_) => error(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

/// POST /api/call — place an outbound call.
pub async fn create_call(
    State(state): State<AppState>,
    Json(req): Json<CallRequest>,
) -> Response {
    tracing::info!(to = %req.to, "Outbound call requested");

    let result = if req.greeting.is_some() || req.conversation {
        state
            .manager
            .make_conversation_call(&req.to, req.greeting.as_deref(), req.metadata)
            .await
    } else if let Some(message) = req.message.as_deref() {
        state.manager.make_call(&req.to, message, req.metadata).await
    } else {
        return error(
            StatusCode::BAD_REQUEST,
            "one of message, greeting or conversation is required",
        );
    };

    match result {
        Ok((call_sid, signaling)) => Json(CallResponse {
            success: true,
            call_sid,
            state: signaling.as_str().to_string(),
        })
        .into_response(),
        Err(e) => {
            tracing::error!("Failed to place call: {e}");
            bridge_error(e)
        }
    }
}

/// POST /api/speak — speak text into a live call.
pub async fn speak(State(state): State<AppState>, Json(req): Json<SpeakRequest>) -> Response {
    match state.manager.speak(&req.call_sid, &req.message).await {
        Ok(()) => Json(OkResponse { success: true }).into_response(),
        Err(e) => {
            tracing::error!(call_sid = %req.call_sid, "Speak failed: {e}");
            bridge_error(e)
        }
    }
}

/// POST /api/end — end a call, optionally with a goodbye message.
pub async fn end_call(State(state): State<AppState>, Json(req): Json<EndRequest>) -> Response {
    match state
        .manager
        .end_call(&req.call_sid, req.message.as_deref())
        .await
    {
        Ok(()) => Json(OkResponse { success: true }).into_response(),
        Err(e) => {
            tracing::error!(call_sid = %req.call_sid, "End failed: {e}");
            bridge_error(e)
        }
    }
}

/// GET /api/call/{call_sid} — one call record.
pub async fn get_call(State(state): State<AppState>, Path(call_sid): Path<String>) -> Response {
    match state.manager.get_record(&call_sid).await {
        Some(record) => Json(record).into_response(),
        None => error(StatusCode::NOT_FOUND, format!("unknown call: {call_sid}")),
    }
}

/// GET /api/calls — all non-terminal calls.
pub async fn list_calls(State(state): State<AppState>) -> Response {
    Json(state.manager.active_calls().await).into_response()
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Response {
    Json(HealthResponse {
        status: "ok",
        active_calls: state.manager.active_count().await,
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use crate::config::{
        AgentConfig, Config, GreetingConfig, ServerConfig, SttConfig, TtsConfig, TwilioConfig,
        WebhookConfig,
    };
    use crate::manager::CallManager;
    use crate::pipeline::tts::TtsClient;
    use crate::twilio::client::TwilioClient;
    use crate::AppState;

    fn test_state() -> AppState {
        let config = Config {
            server: ServerConfig::default(),
            twilio: TwilioConfig {
                account_sid: "AC0".to_string(),
                auth_token: "token".to_string(),
                phone_number: "+15550000".to_string(),
                default_country_code: "1".to_string(),
            },
            webhook: WebhookConfig { base_url: None },
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

    fn json_post(path: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn call_without_message_or_greeting_is_400() {
        let app = crate::router(test_state());
        let resp = app
            .oneshot(json_post("/api/call", r#"{"to": "+15551234567"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("message"));
    }

    #[tokio::test]
    async fn speak_on_unknown_call_is_404() {
        let app = crate::router(test_state());
        let resp = app
            .oneshot(json_post(
                "/api/speak",
                r#"{"callSid": "CA404", "message": "hi"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn end_on_unknown_call_is_404() {
        let app = crate::router(test_state());
        let resp = app
            .oneshot(json_post("/api/end", r#"{"callSid": "CA404"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_unknown_call_is_404() {
        let app = crate::router(test_state());
        let request = Request::builder()
            .uri("/api/call/CA404")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("CA404"));
    }

    #[tokio::test]
    async fn calls_listing_starts_empty() {
        let app = crate::router(test_state());
        let request = Request::builder()
            .uri("/api/calls")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn health_reports_active_calls() {
        let app = crate::router(test_state());
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["activeCalls"], 0);
    }
}
