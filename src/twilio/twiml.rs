//! Minimal TwiML response builder.
//!
//! Twilio consumes an XML document with root `<Response>`; we only ever
//! emit the handful of verbs the bridge uses.

/// Escape text or attribute content for XML.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Builder over a `<Response>` document.
#[derive(Debug, Default)]
pub struct Twiml {
    verbs: Vec<String>,
}

impl Twiml {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<Say>` with carrier-side TTS, the fallback voice path.
    pub fn say(mut self, voice: &str, language: &str, text: &str) -> Self {
        self.verbs.push(format!(
            r#"<Say voice="{}" language="{}">{}</Say>"#,
            escape(voice),
            escape(language),
            escape(text)
        ));
        self
    }

    pub fn hangup(mut self) -> Self {
        self.verbs.push("<Hangup/>".to_string());
        self
    }

    /// `<Connect><Stream/></Connect>` — directs the carrier to open a
    /// media WebSocket back to us.
    pub fn connect_stream(mut self, url: &str, track: &str) -> Self {
        self.verbs.push(format!(
            r#"<Connect><Stream url="{}" track="{}"/></Connect>"#,
            escape(url),
            escape(track)
        ));
        self
    }

    /// `<Gather>` speech/DTMF prompt loop for the non-media-stream path.
    pub fn gather(mut self, action: &str, language: &str, timeout_secs: u32, prompt: Option<&str>) -> Self {
        let inner = match prompt {
            Some(text) => format!(r#"<Say language="{}">{}</Say>"#, escape(language), escape(text)),
            None => String::new(),
        };
        self.verbs.push(format!(
            r#"<Gather input="speech dtmf" method="POST" timeout="{}" speechTimeout="auto" language="{}" action="{}">{}</Gather>"#,
            timeout_secs,
            escape(language),
            escape(action),
            inner
        ));
        self
    }

    pub fn redirect(mut self, url: &str) -> Self {
        self.verbs
            .push(format!("<Redirect>{}</Redirect>", escape(url)));
        self
    }

    pub fn reject(mut self) -> Self {
        self.verbs.push("<Reject/>".to_string());
        self
    }

    pub fn to_xml(&self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response>{}</Response>",
            self.verbs.concat()
        )
    }
}

/// Derive the media-stream WebSocket URL from the public base URL.
pub fn stream_url(base_url: &str) -> String {
    format!(
        "{}/voice/stream",
        base_url
            .trim_end_matches('/')
            .replace("https://", "wss://")
            .replace("http://", "ws://")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_all_reserved_characters() {
        assert_eq!(
            escape(r#"a & b < c > d " e ' f"#),
            "a &amp; b &lt; c &gt; d &quot; e &apos; f"
        );
    }

    #[test]
    fn say_and_hangup() {
        let xml = Twiml::new()
            .say("alice", "en-US", "Your package has arrived.")
            .hangup()
            .to_xml();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains(
            r#"<Say voice="alice" language="en-US">Your package has arrived.</Say><Hangup/>"#
        ));
    }

    #[test]
    fn say_escapes_message_text() {
        let xml = Twiml::new().say("alice", "en", "Tom & Jerry <3").to_xml();
        assert!(xml.contains(">Tom &amp; Jerry &lt;3</Say>"));
    }

    #[test]
    fn connect_stream_sets_url_and_track() {
        let xml = Twiml::new()
            .connect_stream("wss://host/voice/stream", "inbound_track")
            .to_xml();
        assert!(xml.contains(
            r#"<Connect><Stream url="wss://host/voice/stream" track="inbound_track"/></Connect>"#
        ));
    }

    #[test]
    fn gather_wraps_prompt_in_say() {
        let xml = Twiml::new()
            .gather("https://host/voice/gather", "en-US", 5, Some("Anything else?"))
            .to_xml();
        assert!(xml.contains(r#"input="speech dtmf""#));
        assert!(xml.contains(r#"speechTimeout="auto""#));
        assert!(xml.contains(r#"action="https://host/voice/gather""#));
        assert!(xml.contains(r#"<Say language="en-US">Anything else?</Say></Gather>"#));
    }

    #[test]
    fn stream_url_swaps_scheme() {
        assert_eq!(
            stream_url("https://bridge.example.com"),
            "wss://bridge.example.com/voice/stream"
        );
        assert_eq!(
            stream_url("http://localhost:8080/"),
            "ws://localhost:8080/voice/stream"
        );
    }
}
