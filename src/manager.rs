//! Call manager: owns every live call and wires stream ↔ STT ↔ TTS ↔ agent.
//!
//! Turn-taking is enforced here. Conversation state gates whether inbound
//! audio reaches STT; playback completion (the echoed mark) flips the call
//! back to listening; stale finals arriving outside `listening` are
//! dropped on the floor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocket;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::call::{CallRecord, ConversationState, Direction, SignalingState, TranscriptEntry};
use crate::config::Config;
use crate::greeting;
use crate::pipeline::stt::{SttEvent, SttSession};
use crate::pipeline::tts::TtsClient;
use crate::twilio::client::{TwilioClient, TwilioError};
use crate::twilio::session::{SessionEvent, SessionHandle, StreamSession};
use crate::twilio::twiml::{self, Twiml};

/// Voice used for carrier-side `<Say>` fallback.
const SAY_VOICE: &str = "alice";
/// How long `speak_and_listen` waits for the caller before giving up.
const DEFAULT_LISTEN_TIMEOUT: Duration = Duration::from_secs(30);
/// Track selection for media streams; we only transcribe the caller.
const STREAM_TRACK: &str = "inbound_track";

/// Events the manager publishes for the server's forwarding task.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// A final caller utterance, ready for the agent gateway.
    Transcription {
        call_sid: String,
        from: String,
        text: String,
    },
    /// Caller key press. Surfaced, never interpreted.
    Dtmf { call_sid: String, digits: String },
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("unknown call: {0}")]
    UnknownCall(String),
    #[error(transparent)]
    Twilio(#[from] TwilioError),
}

/// One live call: record plus the handles needed to tear it down.
pub struct CallHandle {
    record: Mutex<CallRecord>,
    session: Mutex<Option<SessionHandle>>,
    stt: Mutex<Option<Arc<SttSession>>>,
    /// Serializes assistant utterances; a reply never starts synthesis
    /// while a prior one is still being spoken.
    speak_gate: Mutex<()>,
    /// Final user transcripts for `speak_and_listen` waiters.
    transcripts: broadcast::Sender<String>,
    cancel: CancellationToken,
}

impl CallHandle {
    fn new(record: CallRecord) -> Self {
        let (transcripts, _) = broadcast::channel(8);
        Self {
            record: Mutex::new(record),
            session: Mutex::new(None),
            stt: Mutex::new(None),
            speak_gate: Mutex::new(()),
            transcripts,
            cancel: CancellationToken::new(),
        }
    }
}

/// Whether inbound caller audio is forwarded to STT in this state.
fn forwards_caller_audio(state: ConversationState) -> bool {
    state == ConversationState::Listening
}

/// Strip formatting from a dialable number, defaulting bare national
/// numbers to the configured country code.
pub fn normalize_number(raw: &str, default_country_code: &str) -> String {
    let has_plus = raw.trim_start().starts_with('+');
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();

    if has_plus {
        return format!("+{digits}");
    }
    if digits.len() == 10 {
        return format!("+{default_country_code}{digits}");
    }
    if digits.len() == 11 && digits.starts_with(default_country_code) {
        return format!("+{digits}");
    }
    format!("+{digits}")
}

pub struct CallManager {
    config: Config,
    twilio: Arc<TwilioClient>,
    tts: Arc<TtsClient>,
    calls: Mutex<HashMap<String, Arc<CallHandle>>>,
    events: mpsc::Sender<BridgeEvent>,
}

impl CallManager {
    pub fn new(
        config: Config,
        twilio: Arc<TwilioClient>,
        tts: Arc<TtsClient>,
        events: mpsc::Sender<BridgeEvent>,
    ) -> Self {
        Self {
            config,
            twilio,
            tts,
            calls: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn public_base(&self) -> String {
        self.config
            .webhook
            .base_url
            .clone()
            .unwrap_or_else(|| {
                format!(
                    "http://{}:{}",
                    self.config.server.host, self.config.server.port
                )
            })
            .trim_end_matches('/')
            .to_string()
    }

    fn status_callback_url(&self) -> Option<String> {
        self.config
            .webhook
            .base_url
            .as_ref()
            .map(|base| format!("{}/voice/status", base.trim_end_matches('/')))
    }

    fn normalize(&self, raw: &str) -> String {
        normalize_number(raw, &self.config.twilio.default_country_code)
    }

    async fn get(&self, call_sid: &str) -> Result<Arc<CallHandle>, BridgeError> {
        self.calls
            .lock()
            .await
            .get(call_sid)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownCall(call_sid.to_string()))
    }

    async fn insert(&self, record: CallRecord) -> Arc<CallHandle> {
        let call_sid = record.call_sid.clone();
        let handle = Arc::new(CallHandle::new(record));
        self.calls.lock().await.insert(call_sid, handle.clone());
        handle
    }

    /// Look up a call, creating an inbound record from webhook params if
    /// this is the first time we see the call id.
    async fn ensure_call(
        &self,
        call_sid: &str,
        params: &HashMap<String, String>,
    ) -> Arc<CallHandle> {
        if let Ok(handle) = self.get(call_sid).await {
            return handle;
        }
        tracing::info!(call_sid, "Creating record for unseen call");
        let record = CallRecord::new(
            call_sid,
            params
                .get("AccountSid")
                .cloned()
                .unwrap_or_else(|| self.config.twilio.account_sid.clone()),
            Direction::Inbound,
            params.get("From").cloned().unwrap_or_default(),
            params.get("To").cloned().unwrap_or_default(),
        );
        self.insert(record).await
    }

    /// Place a one-shot call that plays a message and hangs up.
    pub async fn make_call(
        &self,
        to: &str,
        message: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(String, SignalingState), BridgeError> {
        let to = self.normalize(to);
        let xml = Twiml::new()
            .say(SAY_VOICE, &self.config.stt.language, message)
            .hangup()
            .to_xml();

        let created = self
            .twilio
            .create_call(&to, &xml, self.status_callback_url().as_deref())
            .await?;
        let state = created
            .status
            .as_deref()
            .map(SignalingState::parse)
            .unwrap_or(SignalingState::Queued);

        let mut record = CallRecord::new(
            created.sid.clone(),
            self.config.twilio.account_sid.clone(),
            Direction::Outbound,
            self.config.twilio.phone_number.clone(),
            to,
        );
        record.signaling = state;
        record.metadata = metadata;
        record.append_transcript(TranscriptEntry::assistant(message));
        self.insert(record).await;

        Ok((created.sid, state))
    }

    /// Place a conversational call: the carrier opens a media WebSocket
    /// back to us, and the greeting is spoken once it attaches.
    pub async fn make_conversation_call(
        &self,
        to: &str,
        greeting: Option<&str>,
        metadata: HashMap<String, String>,
    ) -> Result<(String, SignalingState), BridgeError> {
        let to = self.normalize(to);
        let xml = Twiml::new()
            .connect_stream(&twiml::stream_url(&self.public_base()), STREAM_TRACK)
            .to_xml();

        let created = self
            .twilio
            .create_call(&to, &xml, self.status_callback_url().as_deref())
            .await?;
        let state = created
            .status
            .as_deref()
            .map(SignalingState::parse)
            .unwrap_or(SignalingState::Queued);

        let mut record = CallRecord::new(
            created.sid.clone(),
            self.config.twilio.account_sid.clone(),
            Direction::Outbound,
            self.config.twilio.phone_number.clone(),
            to,
        );
        record.signaling = state;
        record.metadata = metadata;
        record.pending_greeting = greeting.map(str::to_string);
        self.insert(record).await;

        Ok((created.sid, state))
    }

    /// Adopt an upgraded media-stream WebSocket: wait for the carrier's
    /// `start`, attach STT and either greet or start listening.
    pub async fn handle_media_stream(self: Arc<Self>, socket: WebSocket) {
        let (session, mut session_events) =
            StreamSession::spawn(socket, self.config.stt.flush_frames);

        let (call_sid, stream_sid) = loop {
            match session_events.recv().await {
                Some(SessionEvent::Connected {
                    call_sid,
                    stream_sid,
                }) => break (call_sid, stream_sid),
                Some(SessionEvent::Disconnected) | None => {
                    tracing::warn!("Media stream closed before start");
                    return;
                }
                Some(_) => continue,
            }
        };

        let handle = self.ensure_call(&call_sid, &HashMap::new()).await;
        {
            let mut record = handle.record.lock().await;
            record.stream_sid = Some(stream_sid);
            record.signaling = SignalingState::InProgress;
            if record.answered_at.is_none() {
                record.answered_at = Some(Utc::now());
            }
        }
        *handle.session.lock().await = Some(session.clone());

        // Attach STT. A connect failure leaves the call audible but
        // untranscribed; /api/speak still works.
        let (stt, stt_events) = match SttSession::create(&self.config.stt) {
            Ok((stt, events)) => {
                let stt = Arc::new(stt);
                stt.connect().await;
                *handle.stt.lock().await = Some(stt.clone());
                (Some(stt), events)
            }
            Err(e) => {
                tracing::error!(call_sid = %call_sid, "STT unavailable: {e}");
                let (_tx, rx) = mpsc::channel(1);
                (None, rx)
            }
        };

        tokio::spawn(pump(
            self.clone(),
            handle.clone(),
            call_sid.clone(),
            session,
            session_events,
            stt,
            stt_events,
        ));

        let greeting = handle.record.lock().await.pending_greeting.take();
        match greeting {
            Some(text) => {
                let manager = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.speak(&call_sid, &text).await {
                        tracing::warn!(call_sid = %call_sid, "Greeting failed: {e}");
                    }
                });
            }
            None => {
                handle.record.lock().await.conversation = ConversationState::Listening;
            }
        }
    }

    /// Synthesize `text` into the call. Falls back to a carrier `<Say>`
    /// when no media session is attached or synthesis fails.
    pub async fn speak(&self, call_sid: &str, text: &str) -> Result<(), BridgeError> {
        let handle = self.get(call_sid).await?;
        let _gate = handle.speak_gate.lock().await;

        {
            let mut record = handle.record.lock().await;
            record.conversation = ConversationState::Speaking;
            record.append_transcript(TranscriptEntry::assistant(text));
        }

        let session = handle.session.lock().await.clone();
        if let Some(session) = session {
            match self.tts.synthesize_all_for_twilio(text).await {
                Ok(frames) => match session.send_audio_frames(&frames).await {
                    Ok(done) => {
                        // Resolution is the carrier echoing our mark; the
                        // pump flips the call back to listening then. A
                        // recv error means the stream closed mid-playback.
                        let _ = done.await;
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::warn!(call_sid, "Frame send failed: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!(call_sid, "TTS synthesis failed, using <Say>: {e}");
                }
            }
        }

        // Carrier-side fallback. Its completion is not observable, so the
        // call goes straight back to listening.
        let xml = Twiml::new()
            .say(SAY_VOICE, &self.config.stt.language, text)
            .to_xml();
        handle.record.lock().await.conversation = ConversationState::Listening;
        self.twilio.update_call_twiml(call_sid, &xml).await?;
        Ok(())
    }

    /// Speak, then wait for the caller's next final transcript.
    #[allow(dead_code)]
    pub async fn speak_and_listen(
        &self,
        call_sid: &str,
        text: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<String>, BridgeError> {
        let handle = self.get(call_sid).await?;
        let mut replies = handle.transcripts.subscribe();

        self.speak(call_sid, text).await?;

        match tokio::time::timeout(
            timeout.unwrap_or(DEFAULT_LISTEN_TIMEOUT),
            replies.recv(),
        )
        .await
        {
            Ok(Ok(reply)) => Ok(Some(reply)),
            _ => Ok(None),
        }
    }

    /// End a call, optionally speaking a goodbye first.
    pub async fn end_call(
        &self,
        call_sid: &str,
        message: Option<&str>,
    ) -> Result<(), BridgeError> {
        let handle = self.get(call_sid).await?;

        if let Some(text) = message {
            if let Err(e) = self.speak(call_sid, text).await {
                tracing::warn!(call_sid, "Goodbye failed: {e}");
            }
        }

        let update = self.twilio.complete_call(call_sid).await;

        {
            let mut record = handle.record.lock().await;
            record.signaling = SignalingState::Completed;
            record.conversation = ConversationState::Idle;
            if record.ended_at.is_none() {
                record.ended_at = Some(Utc::now());
            }
        }
        self.release(&handle).await;

        update.map_err(Into::into)
    }

    /// Reconcile carrier-reported status. Idempotent; creates a record on
    /// first observation of an unknown call id.
    pub async fn handle_status_callback(&self, params: &HashMap<String, String>) {
        let Some(call_sid) = params.get("CallSid") else {
            tracing::warn!("Status callback without CallSid");
            return;
        };
        let status = params
            .get("CallStatus")
            .map(|s| SignalingState::parse(s))
            .unwrap_or(SignalingState::Initiated);

        let handle = self.ensure_call(call_sid, params).await;
        let became_terminal;
        {
            let mut record = handle.record.lock().await;
            if record.signaling != status {
                tracing::info!(
                    call_sid,
                    from = record.signaling.as_str(),
                    to = status.as_str(),
                    "Signaling transition"
                );
                record.signaling = status;
            }
            if status == SignalingState::InProgress && record.answered_at.is_none() {
                record.answered_at = Some(Utc::now());
            }
            if let Some(url) = params.get("RecordingUrl") {
                record.recording_url = Some(url.clone());
            }
            became_terminal = status.is_terminal() && record.ended_at.is_none();
            if became_terminal {
                record.ended_at = Some(Utc::now());
                record.conversation = ConversationState::Idle;
            }
        }

        if became_terminal {
            self.release(&handle).await;
        }
    }

    /// Non-media-stream path: the carrier's own recognizer POSTs speech
    /// and digits here; we re-open the gather loop in the response.
    pub async fn handle_gather_callback(&self, params: &HashMap<String, String>) -> String {
        let call_sid = params.get("CallSid").cloned().unwrap_or_default();
        let handle = self.ensure_call(&call_sid, params).await;

        if let Some(speech) = params.get("SpeechResult").filter(|s| !s.is_empty()) {
            let confidence = params.get("Confidence").and_then(|c| c.parse::<f64>().ok());
            let from = {
                let mut record = handle.record.lock().await;
                record.append_transcript(TranscriptEntry::user(speech.clone(), confidence));
                record.from.clone()
            };
            let _ = handle.transcripts.send(speech.clone());
            let _ = self
                .events
                .send(BridgeEvent::Transcription {
                    call_sid: call_sid.clone(),
                    from,
                    text: speech.clone(),
                })
                .await;
        }

        if let Some(digits) = params.get("Digits").filter(|d| !d.is_empty()) {
            let _ = self
                .events
                .send(BridgeEvent::Dtmf {
                    call_sid: call_sid.clone(),
                    digits: digits.clone(),
                })
                .await;
        }

        Twiml::new()
            .gather(
                &format!("{}/voice/gather", self.public_base()),
                &self.config.stt.language,
                5,
                None,
            )
            .to_xml()
    }

    /// Answer an inbound call with TwiML that opens the media stream.
    pub async fn handle_inbound_call(
        &self,
        params: &HashMap<String, String>,
        greeting: Option<String>,
    ) -> String {
        let call_sid = params.get("CallSid").cloned().unwrap_or_default();
        let handle = self.ensure_call(&call_sid, params).await;
        {
            let mut record = handle.record.lock().await;
            record.signaling = SignalingState::InProgress;
            record.pending_greeting = greeting.or_else(|| {
                self.config
                    .greeting
                    .enabled
                    .then(|| greeting::select_greeting(&self.config.greeting.name))
            });
        }

        tracing::info!(call_sid, "Inbound call accepted");

        Twiml::new()
            .connect_stream(&twiml::stream_url(&self.public_base()), STREAM_TRACK)
            .to_xml()
    }

    pub async fn get_record(&self, call_sid: &str) -> Option<CallRecord> {
        let handle = self.get(call_sid).await.ok()?;
        let record = handle.record.lock().await.clone();
        Some(record)
    }

    /// Every call whose signaling state is not terminal.
    pub async fn active_calls(&self) -> Vec<CallRecord> {
        let handles: Vec<Arc<CallHandle>> = self.calls.lock().await.values().cloned().collect();
        let mut records = Vec::new();
        for handle in handles {
            let record = handle.record.lock().await;
            if !record.signaling.is_terminal() {
                records.push(record.clone());
            }
        }
        records
    }

    pub async fn active_count(&self) -> usize {
        self.active_calls().await.len()
    }

    /// Best-effort hangup of every live call, used at process shutdown.
    pub async fn shutdown(&self) {
        let sids: Vec<String> = self
            .active_calls()
            .await
            .into_iter()
            .map(|r| r.call_sid)
            .collect();
        for call_sid in sids {
            tracing::info!(call_sid = %call_sid, "Ending call for shutdown");
            if let Err(e) = self.end_call(&call_sid, None).await {
                tracing::warn!(call_sid = %call_sid, "Shutdown hangup failed: {e}");
            }
        }
    }

    /// Drop a final user utterance into the call: append to transcript,
    /// move to processing and publish for the forwarding task. Finals
    /// arriving outside `listening` are stale and discarded.
    async fn on_final_transcript(
        &self,
        handle: &Arc<CallHandle>,
        call_sid: &str,
        text: String,
        confidence: Option<f64>,
    ) {
        let from = {
            let mut record = handle.record.lock().await;
            if !forwards_caller_audio(record.conversation) {
                tracing::debug!(call_sid, "Dropping stale transcript");
                return;
            }
            record.conversation = ConversationState::Processing;
            record.append_transcript(TranscriptEntry::user(text.clone(), confidence));
            record.from.clone()
        };

        if let Some(stt) = handle.stt.lock().await.as_ref() {
            stt.clear_buffer().await;
        }

        tracing::info!(call_sid, transcript = %text, "Final transcript");
        let _ = handle.transcripts.send(text.clone());
        let _ = self
            .events
            .send(BridgeEvent::Transcription {
                call_sid: call_sid.to_string(),
                from,
                text,
            })
            .await;
    }

    /// Cancel per-call tasks and drop the stream and STT handles.
    async fn release(&self, handle: &Arc<CallHandle>) {
        handle.cancel.cancel();
        if let Some(session) = handle.session.lock().await.take() {
            session.close().await;
        }
        if let Some(stt) = handle.stt.lock().await.take() {
            stt.disconnect().await;
        }
    }
}

/// Per-call event loop: applies turn-taking to session and STT events.
async fn pump(
    manager: Arc<CallManager>,
    handle: Arc<CallHandle>,
    call_sid: String,
    session: SessionHandle,
    mut session_events: mpsc::Receiver<SessionEvent>,
    stt: Option<Arc<SttSession>>,
    mut stt_events: mpsc::Receiver<SttEvent>,
) {
    let cancel = handle.cancel.clone();
    let mut stt_open = true;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,

            event = session_events.recv() => {
                match event {
                    Some(SessionEvent::Audio(pcm)) => {
                        let state = handle.record.lock().await.conversation;
                        if let Some(stt) = &stt {
                            if forwards_caller_audio(state) {
                                stt.send(pcm).await;
                            } else {
                                // Not our turn: drop the audio and keep the
                                // STT buffer from accumulating our own voice.
                                stt.clear_buffer().await;
                            }
                        }
                    }
                    Some(SessionEvent::SpeakingFinished) => {
                        if let Some(stt) = &stt {
                            stt.clear_buffer().await;
                        }
                        let mut record = handle.record.lock().await;
                        if record.conversation == ConversationState::Speaking {
                            record.conversation = ConversationState::Listening;
                        }
                    }
                    Some(SessionEvent::Dtmf(digits)) => {
                        let _ = manager
                            .events
                            .send(BridgeEvent::Dtmf {
                                call_sid: call_sid.clone(),
                                digits,
                            })
                            .await;
                    }
                    Some(SessionEvent::Connected { .. }) => {}
                    Some(SessionEvent::Disconnected) | None => {
                        tracing::info!(call_sid = %call_sid, "Media session ended");
                        manager.release(&handle).await;
                        break;
                    }
                }
            }

            event = stt_events.recv(), if stt_open => {
                match event {
                    Some(SttEvent::Transcript { text, confidence, is_final: true }) => {
                        manager
                            .on_final_transcript(&handle, &call_sid, text, confidence)
                            .await;
                    }
                    Some(SttEvent::Transcript { .. }) => {}
                    Some(SttEvent::SpeechStarted) => {
                        // Barge-in: the caller talks over us, so cut our
                        // own playback and hand the floor back.
                        if manager.config.stt.barge_in && session.is_speaking() {
                            tracing::info!(call_sid = %call_sid, "Barge-in, clearing playback");
                            let _ = session.clear_audio().await;
                            if let Some(stt) = &stt {
                                stt.clear_buffer().await;
                            }
                            handle.record.lock().await.conversation =
                                ConversationState::Listening;
                        }
                    }
                    Some(SttEvent::Connected) => {
                        tracing::debug!(call_sid = %call_sid, "STT connected");
                    }
                    Some(SttEvent::Error(e)) => {
                        tracing::warn!(call_sid = %call_sid, "STT error: {e}");
                    }
                    Some(SttEvent::Disconnected) | None => {
                        tracing::debug!(call_sid = %call_sid, "STT session ended");
                        stt_open = false;
                    }
                }
            }
        }
    }
}
