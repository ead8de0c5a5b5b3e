use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Carrier-visible call status, mapped from Twilio's status strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Queued,
    Initiated,
    Ringing,
    InProgress,
    Completed,
    Busy,
    Failed,
    NoAnswer,
    Canceled,
}

impl SignalingState {
    /// Case-insensitive parse of a carrier status string. Unknown strings
    /// default to `Initiated`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Self::Queued,
            "initiated" => Self::Initiated,
            "ringing" => Self::Ringing,
            "in-progress" => Self::InProgress,
            "completed" => Self::Completed,
            "busy" => Self::Busy,
            "failed" => Self::Failed,
            "no-answer" => Self::NoAnswer,
            "canceled" => Self::Canceled,
            _ => Self::Initiated,
        }
    }

    /// Terminal states release all per-call resources.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Busy | Self::Failed | Self::NoAnswer | Self::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Initiated => "initiated",
            Self::Ringing => "ringing",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Busy => "busy",
            Self::Failed => "failed",
            Self::NoAnswer => "no-answer",
            Self::Canceled => "canceled",
        }
    }
}

/// Per-call turn-taking state. Gates whether inbound audio reaches STT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    #[default]
    Idle,
    Speaking,
    Listening,
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One transcript line. Created on a final STT result (user) or right
/// before synthesis (assistant); never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl TranscriptEntry {
    pub fn user(text: impl Into<String>, confidence: Option<f64>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp: Utc::now(),
            confidence,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            timestamp: Utc::now(),
            confidence: None,
        }
    }
}

/// Per-call memory: identity, direction, timeline, transcript and state.
/// Lives in the manager's map from creation until process shutdown.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_sid: String,
    pub account_sid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_sid: Option<String>,
    pub direction: Direction,
    pub from: String,
    pub to: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub signaling: SignalingState,
    pub conversation: ConversationState,
    pub transcript: Vec<TranscriptEntry>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Spoken once the media stream attaches, then cleared.
    #[serde(skip)]
    pub pending_greeting: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_url: Option<String>,
}

impl CallRecord {
    pub fn new(
        call_sid: impl Into<String>,
        account_sid: impl Into<String>,
        direction: Direction,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            call_sid: call_sid.into(),
            account_sid: account_sid.into(),
            stream_sid: None,
            direction,
            from: from.into(),
            to: to.into(),
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            signaling: SignalingState::Queued,
            conversation: ConversationState::Idle,
            transcript: Vec::new(),
            metadata: HashMap::new(),
            pending_greeting: None,
            recording_url: None,
        }
    }

    /// Whole seconds between answer and hangup; 0 when either is missing
    /// or the carrier reports them out of order.
    pub fn duration_secs(&self) -> i64 {
        match (self.answered_at, self.ended_at) {
            (Some(answered), Some(ended)) => (ended - answered).num_seconds().max(0),
            _ => 0,
        }
    }

    pub fn append_transcript(&mut self, entry: TranscriptEntry) {
        self.transcript.push(entry);
    }
}
