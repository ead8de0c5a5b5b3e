//! Deepgram streaming STT over WebSocket.
//!
//! Runs as a small actor task owning the connection. Commands arrive on a
//! channel so the session reader never blocks on provider I/O. Audio sent
//! while the link is down is buffered and flushed in order after a
//! successful reconnect.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::SttEvent;

const LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";
const MAX_RECONNECT_ATTEMPTS: u32 = 3;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Cmd {
    Connect,
    Audio(Bytes),
    Clear,
    Finalize,
    Disconnect,
}

/// Handle to one streaming STT session.
pub struct DeepgramStt {
    cmd: mpsc::Sender<Cmd>,
}

impl DeepgramStt {
    pub fn spawn(api_key: String, language: String, events: mpsc::Sender<SttEvent>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        tokio::spawn(run(api_key, language, events, cmd_rx));
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

/// Result frames from the provider. Only the fields we act on.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ProviderMessage {
    Results {
        channel: ResultChannel,
        #[serde(default)]
        is_final: bool,
    },
    SpeechStarted {},
    UtteranceEnd {},
    Metadata {},
}

#[derive(Debug, Deserialize)]
struct ResultChannel {
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    transcript: String,
    #[serde(default)]
    confidence: Option<f64>,
}

async fn run(
    api_key: String,
    language: String,
    events: mpsc::Sender<SttEvent>,
    mut cmd_rx: mpsc::Receiver<Cmd>,
) {
    let mut ws: Option<WsStream> = None;
    // Audio queued while the link is down, flushed in order on reconnect.
    let mut backlog: Vec<Bytes> = Vec::new();
    let mut reconnect: Option<(Instant, u32)> = None;
    let mut finalizing = false;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Cmd::Connect) => {
                        if ws.is_none() && reconnect.is_none() {
                            match dial(&api_key, &language).await {
                                Ok(stream) => {
                                    ws = Some(stream);
                                    let _ = events.send(SttEvent::Connected).await;
                                }
                                Err(e) => {
                                    tracing::warn!("STT connect failed: {e}");
                                    let _ = events.send(SttEvent::Error(e)).await;
                                }
                            }
                        }
                    }
                    Some(Cmd::Audio(pcm)) => {
                        match ws.as_mut() {
                            Some(stream) => {
                                if let Err(e) = stream.send(Message::Binary(pcm)).await {
                                    tracing::warn!("STT send failed, reconnecting: {e}");
                                    ws = None;
                                    reconnect = Some((Instant::now() + backoff(1), 1));
                                }
                            }
                            None => backlog.push(pcm),
                        }
                    }
                    Some(Cmd::Clear) => backlog.clear(),
                    Some(Cmd::Finalize) => {
                        finalizing = true;
                        if let Some(stream) = ws.as_mut() {
                            let close = r#"{"type":"CloseStream"}"#;
                            if stream.send(Message::Text(close.into())).await.is_err() {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                    Some(Cmd::Disconnect) | None => break,
                }
            }

            msg = next_message(&mut ws) => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&text, &events).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        if finalizing {
                            break;
                        }
                        tracing::warn!("STT stream closed, scheduling reconnect");
                        ws = None;
                        reconnect = Some((Instant::now() + backoff(1), 1));
                    }
                    Some(Err(e)) => {
                        if finalizing {
                            break;
                        }
                        tracing::warn!("STT stream error, scheduling reconnect: {e}");
                        ws = None;
                        reconnect = Some((Instant::now() + backoff(1), 1));
                    }
                    Some(Ok(_)) => {}
                }
            }

            () = sleep_until_opt(reconnect.map(|(at, _)| at)) => {
                let (_, attempt) = reconnect.take().unwrap_or((Instant::now(), 1));
                match dial(&api_key, &language).await {
                    Ok(mut stream) => {
                        tracing::info!(attempt, "STT reconnected");
                        let mut failed = false;
                        for pcm in backlog.drain(..) {
                            if stream.send(Message::Binary(pcm)).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            reconnect = Some((Instant::now() + backoff(attempt + 1), attempt + 1));
                        } else {
                            ws = Some(stream);
                        }
                    }
                    Err(e) if attempt >= MAX_RECONNECT_ATTEMPTS => {
                        tracing::error!("STT reconnect gave up after {attempt} attempts: {e}");
                        let _ = events.send(SttEvent::Error(e)).await;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(attempt, "STT reconnect failed: {e}");
                        reconnect = Some((Instant::now() + backoff(attempt + 1), attempt + 1));
                    }
                }
            }
        }
    }

    if let Some(mut stream) = ws.take() {
        let _ = stream.close(None).await;
    }
    let _ = events.send(SttEvent::Disconnected).await;
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(attempt as u64)
}

async fn next_message(
    ws: &mut Option<WsStream>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match ws.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn handle_text(text: &str, events: &mpsc::Sender<SttEvent>) {
    let parsed: ProviderMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!("Unrecognized STT frame: {e}");
            return;
        }
    };

    match parsed {
        ProviderMessage::Results { channel, is_final } => {
            let Some(alt) = channel.alternatives.first() else {
                return;
            };
            let text = alt.transcript.trim();
            if text.is_empty() {
                return;
            }
            let _ = events
                .send(SttEvent::Transcript {
                    text: text.to_string(),
                    confidence: alt.confidence,
                    is_final,
                })
                .await;
        }
        ProviderMessage::SpeechStarted {} => {
            let _ = events.send(SttEvent::SpeechStarted).await;
        }
        ProviderMessage::UtteranceEnd {} | ProviderMessage::Metadata {} => {}
    }
}

async fn dial(api_key: &str, language: &str) -> Result<WsStream, String> {
    let url = format!(
        "{LISTEN_URL}?encoding=linear16&sample_rate=16000&channels=1&language={language}&interim_results=true&vad_events=true"
    );

    let mut request = url
        .into_client_request()
        .map_err(|e| format!("bad STT url: {e}"))?;
    let auth = format!("Token {api_key}")
        .parse()
        .map_err(|e| format!("bad auth header: {e}"))?;
    request.headers_mut().insert("Authorization", auth);

    let (stream, _) = connect_async(request)
        .await
        .map_err(|e| format!("connect failed: {e}"))?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn results_frame_emits_transcript() {
        let (tx, mut rx) = mpsc::channel(8);
        let raw = r#"{
            "type": "Results",
            "is_final": true,
            "channel": {"alternatives": [{"transcript": "hello there", "confidence": 0.95}]}
        }"#;
        handle_text(raw, &tx).await;
        match rx.recv().await.unwrap() {
            SttEvent::Transcript {
                text,
                confidence,
                is_final,
            } => {
                assert_eq!(text, "hello there");
                assert_eq!(confidence, Some(0.95));
                assert!(is_final);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_transcript_is_dropped() {
        let (tx, mut rx) = mpsc::channel(8);
        let raw = r#"{
            "type": "Results",
            "is_final": false,
            "channel": {"alternatives": [{"transcript": "  ", "confidence": 0.1}]}
        }"#;
        handle_text(raw, &tx).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn speech_started_is_surfaced() {
        let (tx, mut rx) = mpsc::channel(8);
        handle_text(r#"{"type": "SpeechStarted", "timestamp": 1.2}"#, &tx).await;
        assert!(matches!(rx.recv().await.unwrap(), SttEvent::SpeechStarted));
    }

    #[test]
    fn backoff_is_linear() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(3), Duration::from_secs(3));
    }
}
