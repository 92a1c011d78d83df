use std::fmt;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

/// Header carrying the provider's payload signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    MalformedSignature,
    InvalidSignature,
    TokenNotConfigured,
    TokenMismatch,
    UnsupportedMode(String),
    MissingChallenge,
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationError::MissingSignature =>
                write!(f, "missing signature header"),
            VerificationError::MalformedSignature =>
                write!(f, "malformed signature header"),
            VerificationError::InvalidSignature =>
                write!(f, "signature does not match payload"),
            VerificationError::TokenNotConfigured =>
                write!(f, "no verify token configured"),
            VerificationError::TokenMismatch =>
                write!(f, "verify token mismatch"),
            VerificationError::UnsupportedMode(mode) =>
                write!(f, "unsupported hub.mode: {}", mode),
            VerificationError::MissingChallenge =>
                write!(f, "missing hub.challenge"),
        }
    }
}

impl std::error::Error for VerificationError {}

/// Hex HMAC-SHA256 of a raw body.
pub fn compute_signature(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = new_mac(secret);
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// `sha256=<hex>` as sent by the provider.
pub fn format_signature_header(signature_hex: &str) -> String {
    format!("{}{}", SIGNATURE_PREFIX, signature_hex)
}

/// Check an `X-Hub-Signature-256` header against the raw body.
///
/// Comparison runs in constant time through the MAC itself.
pub fn verify_signature_header(
    secret: &[u8],
    payload: &[u8],
    header: Option<&str>,
) -> Result<(), VerificationError> {
    let header = header.ok_or(VerificationError::MissingSignature)?;
    let signature_hex = header
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(VerificationError::MalformedSignature)?;
    let signature = hex::decode(signature_hex).map_err(|_| VerificationError::MalformedSignature)?;

    let mut mac = new_mac(secret);
    mac.update(payload);
    mac.verify_slice(&signature)
        .map_err(|_| VerificationError::InvalidSignature)
}

fn new_mac(secret: &[u8]) -> Hmac<Sha256> {
    // HMAC accepts keys of any length, so this cannot fail.
    match Hmac::<Sha256>::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac accepts any key length"),
    }
}

/// Query parameters of the subscription handshake.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,

    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,

    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Validate a handshake and return the challenge to echo.
///
/// A relay without a configured token refuses every handshake.
pub fn verify_subscription(
    query: &SubscriptionQuery,
    expected_token: Option<&str>,
) -> Result<String, VerificationError> {
    let expected = expected_token.ok_or(VerificationError::TokenNotConfigured)?;

    if let Some(mode) = query.mode.as_deref() {
        if mode != "subscribe" {
            return Err(VerificationError::UnsupportedMode(mode.to_string()));
        }
    }

    if query.verify_token.as_deref() != Some(expected) {
        return Err(VerificationError::TokenMismatch);
    }

    query
        .challenge
        .clone()
        .ok_or(VerificationError::MissingChallenge)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trip() {
        let body = br#"{"entry":[]}"#;
        let header = format_signature_header(&compute_signature(b"app-secret", body));
        assert!(header.starts_with("sha256="));
        assert_eq!(verify_signature_header(b"app-secret", body, Some(&header)), Ok(()));
    }

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2.
        assert_eq!(
            compute_signature(b"Jefe", b"what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn tampered_body_is_rejected() {
        let header = format_signature_header(&compute_signature(b"s", b"original"));
        assert_eq!(
            verify_signature_header(b"s", b"tampered", Some(&header)),
            Err(VerificationError::InvalidSignature)
        );
    }

    #[test]
    fn missing_or_malformed_headers() {
        assert_eq!(
            verify_signature_header(b"s", b"x", None),
            Err(VerificationError::MissingSignature)
        );
        assert_eq!(
            verify_signature_header(b"s", b"x", Some("sha1=abcd")),
            Err(VerificationError::MalformedSignature)
        );
        assert_eq!(
            verify_signature_header(b"s", b"x", Some("sha256=zz")),
            Err(VerificationError::MalformedSignature)
        );
    }

    fn query(mode: Option<&str>, token: Option<&str>, challenge: Option<&str>) -> SubscriptionQuery {
        SubscriptionQuery {
            mode: mode.map(str::to_string),
            verify_token: token.map(str::to_string),
            challenge: challenge.map(str::to_string),
        }
    }

    #[test]
    fn handshake_echoes_challenge_on_match() {
        let q = query(Some("subscribe"), Some("tok"), Some("1158201444"));
        assert_eq!(verify_subscription(&q, Some("tok")), Ok("1158201444".to_string()));
    }

    #[test]
    fn handshake_rejections() {
        let q = query(Some("subscribe"), Some("tok"), Some("c"));
        assert_eq!(verify_subscription(&q, None), Err(VerificationError::TokenNotConfigured));
        assert_eq!(verify_subscription(&q, Some("other")), Err(VerificationError::TokenMismatch));

        let q = query(None, None, Some("c"));
        assert_eq!(verify_subscription(&q, Some("tok")), Err(VerificationError::TokenMismatch));

        let q = query(Some("unsubscribe"), Some("tok"), Some("c"));
        assert!(matches!(
            verify_subscription(&q, Some("tok")),
            Err(VerificationError::UnsupportedMode(_))
        ));

        let q = query(Some("subscribe"), Some("tok"), None);
        assert_eq!(verify_subscription(&q, Some("tok")), Err(VerificationError::MissingChallenge));
    }
}
