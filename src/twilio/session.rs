//! Per-call media-stream session.
//!
//! One task owns the carrier WebSocket and multiplexes between inbound
//! envelopes and queued outbound messages, the same select-loop shape the
//! rest of the bridge uses for channel plumbing. Callers hold a cloneable
//! [`SessionHandle`] for outbound operations and receive parsed
//! [`SessionEvent`]s on an mpsc channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::pipeline::audio;
use crate::twilio::envelope::{self, StreamEvent};

/// Events emitted by a media-stream session.
#[derive(Debug)]
pub enum SessionEvent {
    /// The carrier sent `start`; the call is now addressable.
    Connected {
        call_sid: String,
        stream_sid: String,
    },
    /// A flushed batch of inbound audio as 16 kHz little-endian PCM.
    Audio(Bytes),
    /// Caller pressed a key. Surfaced, never interpreted.
    Dtmf(String),
    /// Every outstanding playback mark has been acknowledged.
    SpeakingFinished,
    /// The stream stopped or the socket closed.
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("media stream has not started")]
    NotStarted,
    #[error("media stream is closed")]
    Closed,
    #[error("no audio frames to send")]
    EmptyAudio,
}

struct Shared {
    stream_sid: Mutex<Option<String>>,
    pending_marks: Mutex<HashMap<String, oneshot::Sender<()>>>,
    is_speaking: AtomicBool,
    mark_seq: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            stream_sid: Mutex::new(None),
            pending_marks: Mutex::new(HashMap::new()),
            is_speaking: AtomicBool::new(false),
            mark_seq: AtomicU64::new(0),
        }
    }

    /// Resolve an echoed mark. Returns true when this was the last
    /// outstanding mark of an active utterance (playback finished).
    async fn resolve_mark(&self, name: &str) -> bool {
        let mut pending = self.pending_marks.lock().await;
        if let Some(tx) = pending.remove(name) {
            let _ = tx.send(());
        }
        if pending.is_empty() {
            self.is_speaking.swap(false, Ordering::SeqCst)
        } else {
            false
        }
    }

    /// Drop every outstanding resolver, waking awaiters with a recv error.
    async fn cancel_pending(&self) {
        self.pending_marks.lock().await.clear();
        self.is_speaking.store(false, Ordering::SeqCst);
    }
}

/// Cloneable handle for outbound operations on a live session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Message>,
}

impl SessionHandle {
    pub fn is_speaking(&self) -> bool {
        self.shared.is_speaking.load(Ordering::SeqCst)
    }

    async fn started_sid(&self) -> Result<String, SessionError> {
        self.shared
            .stream_sid
            .lock()
            .await
            .clone()
            .ok_or(SessionError::NotStarted)
    }

    /// Enqueue a single mu-law chunk as one `media` envelope.
    #[allow(dead_code)]
    pub async fn send_audio(&self, mulaw: &[u8]) -> Result<(), SessionError> {
        let Ok(stream_sid) = self.started_sid().await else {
            tracing::warn!("Dropping outbound audio: stream not started");
            return Err(SessionError::NotStarted);
        };
        let payload = base64::engine::general_purpose::STANDARD.encode(mulaw);
        self.outbound
            .send(Message::Text(
                envelope::media_message(&stream_sid, &payload).into(),
            ))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Send an utterance as `media` envelopes followed by one uniquely
    /// named `mark`. The returned receiver completes when the carrier
    /// echoes that mark back, i.e. when playback has finished. Completion
    /// is bounded by stream liveness, not by a timer.
    pub async fn send_audio_frames(
        &self,
        frames: &[Vec<u8>],
    ) -> Result<oneshot::Receiver<()>, SessionError> {
        if frames.is_empty() {
            return Err(SessionError::EmptyAudio);
        }
        let stream_sid = self.started_sid().await?;

        self.shared.is_speaking.store(true, Ordering::SeqCst);

        for frame in frames {
            let payload = base64::engine::general_purpose::STANDARD.encode(frame);
            self.outbound
                .send(Message::Text(
                    envelope::media_message(&stream_sid, &payload).into(),
                ))
                .await
                .map_err(|_| SessionError::Closed)?;
        }

        let name = format!(
            "utterance-{}",
            self.shared.mark_seq.fetch_add(1, Ordering::SeqCst)
        );
        let (tx, rx) = oneshot::channel();
        self.shared.pending_marks.lock().await.insert(name.clone(), tx);

        self.outbound
            .send(Message::Text(
                envelope::mark_message(&stream_sid, &name).into(),
            ))
            .await
            .map_err(|_| SessionError::Closed)?;

        Ok(rx)
    }

    /// Tell the carrier to discard queued outbound audio immediately and
    /// cancel every outstanding playback mark.
    pub async fn clear_audio(&self) -> Result<(), SessionError> {
        let stream_sid = self.started_sid().await?;
        self.outbound
            .send(Message::Text(envelope::clear_message(&stream_sid).into()))
            .await
            .map_err(|_| SessionError::Closed)?;
        self.shared.cancel_pending().await;
        Ok(())
    }

    /// Best-effort close of the underlying WebSocket.
    pub async fn close(&self) {
        let _ = self.outbound.send(Message::Close(None)).await;
    }

    #[cfg(test)]
    fn for_test() -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                shared: Arc::new(Shared::new()),
                outbound: tx,
            },
            rx,
        )
    }
}

pub struct StreamSession;

impl StreamSession {
    /// Take ownership of an upgraded WebSocket and run it as a session.
    pub fn spawn(socket: WebSocket, flush_frames: usize) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let shared = Arc::new(Shared::new());

        let handle = SessionHandle {
            shared: shared.clone(),
            outbound: outbound_tx,
        };

        tokio::spawn(run(socket, events_tx, outbound_rx, shared, flush_frames));

        (handle, events_rx)
    }
}

async fn run(
    mut socket: WebSocket,
    events: mpsc::Sender<SessionEvent>,
    mut outbound: mpsc::Receiver<Message>,
    shared: Arc<Shared>,
    flush_frames: usize,
) {
    let mut inbound: Vec<Vec<u8>> = Vec::with_capacity(flush_frames);
    let mut call_sid = String::new();

    loop {
        tokio::select! {
            ws_msg = socket.recv() => {
                let text = match ws_msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(call_sid = %call_sid, "Media stream closed");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!(call_sid = %call_sid, "Media stream error: {e}");
                        break;
                    }
                    _ => continue,
                };

                let event: StreamEvent = match serde_json::from_str(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!("Unparseable stream envelope: {e}");
                        continue;
                    }
                };

                match event {
                    StreamEvent::Connected { .. } => {
                        tracing::debug!("Stream handshake received");
                    }
                    StreamEvent::Start { stream_sid, start } => {
                        call_sid = start.call_sid.clone();
                        *shared.stream_sid.lock().await = Some(stream_sid.clone());
                        tracing::info!(
                            call_sid = %call_sid,
                            stream_sid = %stream_sid,
                            "Stream started"
                        );
                        if events
                            .send(SessionEvent::Connected {
                                call_sid: start.call_sid,
                                stream_sid,
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    StreamEvent::Media { media } => {
                        let chunk = match base64::engine::general_purpose::STANDARD
                            .decode(&media.payload)
                        {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                tracing::warn!("Bad base64 media payload: {e}");
                                continue;
                            }
                        };
                        inbound.push(chunk);
                        if inbound.len() >= flush_frames
                            && flush_inbound(&mut inbound, &events).await.is_err()
                        {
                            break;
                        }
                    }
                    StreamEvent::Mark { mark } => {
                        if shared.resolve_mark(&mark.name).await
                            && events.send(SessionEvent::SpeakingFinished).await.is_err()
                        {
                            break;
                        }
                    }
                    StreamEvent::Dtmf { dtmf } => {
                        if events.send(SessionEvent::Dtmf(dtmf.digit)).await.is_err() {
                            break;
                        }
                    }
                    StreamEvent::Stop { .. } => {
                        tracing::info!(call_sid = %call_sid, "Stream stopped");
                        let _ = flush_inbound(&mut inbound, &events).await;
                        break;
                    }
                }
            }

            msg = outbound.recv() => {
                match msg {
                    Some(msg) => {
                        if let Err(e) = socket.send(msg).await {
                            tracing::error!(call_sid = %call_sid, "Outbound send failed: {e}");
                            break;
                        }
                    }
                    // Every handle dropped; nothing left to write.
                    None => break,
                }
            }
        }
    }

    shared.cancel_pending().await;
    let _ = events.send(SessionEvent::Disconnected).await;
}

/// Convert buffered mu-law chunks to 16 kHz PCM and emit them.
async fn flush_inbound(
    inbound: &mut Vec<Vec<u8>>,
    events: &mpsc::Sender<SessionEvent>,
) -> Result<(), mpsc::error::SendError<SessionEvent>> {
    if inbound.is_empty() {
        return Ok(());
    }
    let pcm = audio::convert_from_twilio(inbound, audio::STT_SAMPLE_RATE);
    inbound.clear();
    events.send(SessionEvent::Audio(pcm.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start_stream(handle: &SessionHandle) {
        *handle.shared.stream_sid.lock().await = Some("MZ1".to_string());
    }

    fn parse(msg: &Message) -> serde_json::Value {
        match msg {
            Message::Text(text) => serde_json::from_str(text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_audio_before_start_is_rejected() {
        let (handle, _rx) = SessionHandle::for_test();
        let err = handle.send_audio(&[0xFF; 160]).await.unwrap_err();
        assert!(matches!(err, SessionError::NotStarted));
    }

    #[tokio::test]
    async fn frames_then_single_mark_then_resolution() {
        let (handle, mut out) = SessionHandle::for_test();
        start_stream(&handle).await;

        let frames = vec![vec![0xFF; 160], vec![0xFE; 160], vec![0xFD; 160]];
        let done = handle.send_audio_frames(&frames).await.unwrap();
        assert!(handle.is_speaking());

        // Three media envelopes, then exactly one mark.
        for expected in ["//////", "/v7+", "/f39"] {
            let value = parse(&out.recv().await.unwrap());
            assert_eq!(value["event"], "media");
            assert!(value["media"]["payload"]
                .as_str()
                .unwrap()
                .starts_with(expected));
        }
        let mark = parse(&out.recv().await.unwrap());
        assert_eq!(mark["event"], "mark");
        let name = mark["mark"]["name"].as_str().unwrap().to_string();
        assert!(name.starts_with("utterance-"));
        assert!(out.try_recv().is_err());

        // Echoing the mark resolves the receiver and ends speaking.
        assert!(handle.shared.resolve_mark(&name).await);
        assert!(!handle.is_speaking());
        done.await.unwrap();
    }

    #[tokio::test]
    async fn mark_names_are_unique() {
        let (handle, mut out) = SessionHandle::for_test();
        start_stream(&handle).await;

        let _rx1 = handle.send_audio_frames(&[vec![0xFF; 160]]).await.unwrap();
        let _rx2 = handle.send_audio_frames(&[vec![0xFF; 160]]).await.unwrap();

        let mut names = Vec::new();
        while let Ok(msg) = out.try_recv() {
            let value = parse(&msg);
            if value["event"] == "mark" {
                names.push(value["mark"]["name"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(names.len(), 2);
        assert_ne!(names[0], names[1]);
    }

    #[tokio::test]
    async fn unresolved_mark_keeps_speaking() {
        let (handle, _out) = SessionHandle::for_test();
        start_stream(&handle).await;

        let _rx1 = handle.send_audio_frames(&[vec![0xFF; 160]]).await.unwrap();
        let _rx2 = handle.send_audio_frames(&[vec![0xFF; 160]]).await.unwrap();

        // Only one of the two marks echoed: still speaking.
        assert!(!handle.shared.resolve_mark("utterance-0").await);
        assert!(handle.is_speaking());
        assert!(handle.shared.resolve_mark("utterance-1").await);
        assert!(!handle.is_speaking());
    }

    #[tokio::test]
    async fn clear_audio_cancels_pending_marks() {
        let (handle, mut out) = SessionHandle::for_test();
        start_stream(&handle).await;

        let done = handle.send_audio_frames(&[vec![0xFF; 160]]).await.unwrap();
        handle.clear_audio().await.unwrap();

        assert!(!handle.is_speaking());
        // The awaiter is woken with a cancellation, not left pending.
        assert!(done.await.is_err());

        let mut saw_clear = false;
        while let Ok(msg) = out.try_recv() {
            if parse(&msg)["event"] == "clear" {
                saw_clear = true;
            }
        }
        assert!(saw_clear);
    }

    #[tokio::test]
    async fn empty_utterance_is_rejected() {
        let (handle, _out) = SessionHandle::for_test();
        start_stream(&handle).await;
        let err = handle.send_audio_frames(&[]).await.unwrap_err();
        assert!(matches!(err, SessionError::EmptyAudio));
    }
}
