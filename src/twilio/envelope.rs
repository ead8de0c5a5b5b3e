//! Twilio media-stream WebSocket messages.
//!
//! Inbound frames are JSON text tagged by `event`; outbound frames are the
//! `media` / `mark` / `clear` envelopes.

use serde::Deserialize;

/// Messages Twilio sends over the media-stream WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamEvent {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMetadata,
    },
    Media {
        media: MediaPayload,
    },
    Mark {
        mark: MarkPayload,
    },
    Dtmf {
        dtmf: DtmfPayload,
    },
    Stop {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMetadata {
    pub call_sid: String,
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub tracks: Vec<String>,
    #[serde(default)]
    pub media_format: Option<MediaFormat>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub channels: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Base64-encoded mu-law audio.
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct DtmfPayload {
    pub digit: String,
    #[serde(default)]
    pub track: Option<String>,
}

/// Outbound `media` envelope carrying base64 mu-law audio.
pub fn media_message(stream_sid: &str, payload_b64: &str) -> String {
    serde_json::json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": { "payload": payload_b64 }
    })
    .to_string()
}

/// Outbound `mark` envelope; Twilio echoes the name back once every
/// previously queued audio frame has played out.
pub fn mark_message(stream_sid: &str, name: &str) -> String {
    serde_json::json!({
        "event": "mark",
        "streamSid": stream_sid,
        "mark": { "name": name }
    })
    .to_string()
}

/// Outbound `clear` envelope; discards all queued outbound audio.
pub fn clear_message(stream_sid: &str) -> String {
    serde_json::json!({
        "event": "clear",
        "streamSid": stream_sid
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_event() {
        let raw = r#"{
            "event": "start",
            "sequenceNumber": "1",
            "streamSid": "MZ1",
            "start": {
                "streamSid": "MZ1",
                "accountSid": "AC0",
                "callSid": "CA1",
                "tracks": ["inbound"],
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
            }
        }"#;
        let event: StreamEvent = serde_json::from_str(raw).unwrap();
        match event {
            StreamEvent::Start { stream_sid, start } => {
                assert_eq!(stream_sid, "MZ1");
                assert_eq!(start.call_sid, "CA1");
                assert_eq!(start.account_sid.as_deref(), Some("AC0"));
                let format = start.media_format.unwrap();
                assert_eq!(format.sample_rate, Some(8000));
            }
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn parses_media_event() {
        let raw = r#"{
            "event": "media",
            "streamSid": "MZ1",
            "media": {"track": "inbound", "chunk": "2", "timestamp": "20", "payload": "//8="}
        }"#;
        let event: StreamEvent = serde_json::from_str(raw).unwrap();
        match event {
            StreamEvent::Media { media } => {
                assert_eq!(media.payload, "//8=");
                assert_eq!(media.track.as_deref(), Some("inbound"));
            }
            other => panic!("expected media, got {other:?}"),
        }
    }

    #[test]
    fn parses_mark_and_dtmf() {
        let mark: StreamEvent = serde_json::from_str(
            r#"{"event": "mark", "streamSid": "MZ1", "mark": {"name": "utterance-3"}}"#,
        )
        .unwrap();
        assert!(matches!(
            mark,
            StreamEvent::Mark { mark } if mark.name == "utterance-3"
        ));

        let dtmf: StreamEvent = serde_json::from_str(
            r#"{"event": "dtmf", "streamSid": "MZ1", "dtmf": {"digit": "5", "track": "inbound_track"}}"#,
        )
        .unwrap();
        assert!(matches!(
            dtmf,
            StreamEvent::Dtmf { dtmf } if dtmf.digit == "5"
        ));
    }

    #[test]
    fn outbound_envelopes_round_trip() {
        let media: serde_json::Value =
            serde_json::from_str(&media_message("MZ1", "AAAA")).unwrap();
        assert_eq!(media["event"], "media");
        assert_eq!(media["streamSid"], "MZ1");
        assert_eq!(media["media"]["payload"], "AAAA");

        let mark: serde_json::Value = serde_json::from_str(&mark_message("MZ1", "m-1")).unwrap();
        assert_eq!(mark["event"], "mark");
        assert_eq!(mark["mark"]["name"], "m-1");

        let clear: serde_json::Value = serde_json::from_str(&clear_message("MZ1")).unwrap();
        assert_eq!(clear["event"], "clear");
        assert_eq!(clear["streamSid"], "MZ1");
    }
}
