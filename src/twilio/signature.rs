//! Twilio webhook signature validation.
//!
//! The carrier signs each webhook: form parameters sorted by key are
//! concatenated as `key + value` onto the full request URL, HMAC-SHA1'd
//! with the account auth token and base64-encoded into the
//! `X-Twilio-Signature` header.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

pub const SIGNATURE_HEADER: &str = "x-twilio-signature";

/// Compute the expected signature for a request.
pub fn compute(auth_token: &str, url: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut payload = String::from(url);
    for (key, value) in sorted {
        payload.push_str(key);
        payload.push_str(value);
    }

    // HMAC accepts keys of any length.
    let mut mac =
        HmacSha1::new_from_slice(auth_token.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Validate a signature header value in constant time.
pub fn validate(auth_token: &str, url: &str, params: &[(String, String)], signature: &str) -> bool {
    let Ok(provided) = base64::engine::general_purpose::STANDARD.decode(signature) else {
        return false;
    };

    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut payload = String::from(url);
    for (key, value) in sorted {
        payload.push_str(key);
        payload.push_str(value);
    }

    let mut mac =
        HmacSha1::new_from_slice(auth_token.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    mac.verify_slice(&provided).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Vec<(String, String)> {
        vec![
            ("CallSid".to_string(), "CA1234".to_string()),
            ("From".to_string(), "+15550001".to_string()),
            ("To".to_string(), "+15559999".to_string()),
        ]
    }

    const TOKEN: &str = "12345abcde";
    const URL: &str = "https://bridge.example.com/voice/status";

    #[test]
    fn valid_signature_verifies() {
        let sig = compute(TOKEN, URL, &params());
        assert!(validate(TOKEN, URL, &params(), &sig));
    }

    #[test]
    fn param_order_does_not_matter() {
        let mut shuffled = params();
        shuffled.reverse();
        let sig = compute(TOKEN, URL, &params());
        assert!(validate(TOKEN, URL, &shuffled, &sig));
    }

    #[test]
    fn mutated_param_fails() {
        let sig = compute(TOKEN, URL, &params());
        let mut tampered = params();
        tampered[0].1 = "CA1235".to_string();
        assert!(!validate(TOKEN, URL, &tampered, &sig));
    }

    #[test]
    fn mutated_url_fails() {
        let sig = compute(TOKEN, URL, &params());
        assert!(!validate(
            TOKEN,
            "https://bridge.example.com/voice/inbound",
            &params(),
            &sig
        ));
    }

    #[test]
    fn wrong_token_fails() {
        let sig = compute(TOKEN, URL, &params());
        assert!(!validate("12345abcdf", URL, &params(), &sig));
    }

    #[test]
    fn garbage_signature_fails() {
        assert!(!validate(TOKEN, URL, &params(), "not base64 at all!!"));
    }
}
