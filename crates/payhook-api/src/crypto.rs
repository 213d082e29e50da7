//! HMAC-SHA256 signature primitives for webhook authentication.
//!
//! Providers sign the raw request body and send the digest in a header.
//! Three header formats are accepted: `sha256=<hex>`, `v1=<hex>`, and
//! bare 64-character hex. Comparison is constant-time so the expected
//! digest cannot be probed byte by byte.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Why a signature check failed. Returned detail is safe to log but is
/// never echoed back to the caller verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// The header value matched none of the accepted formats.
    InvalidFormat(String),
    /// The digest did not match the payload.
    Mismatch,
    /// The configured secret could not key the MAC.
    InvalidSecret,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidFormat(detail) => write!(f, "invalid signature format: {detail}"),
            Self::Mismatch => write!(f, "signature mismatch"),
            Self::InvalidSecret => write!(f, "invalid secret key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Verifies `signature` against the HMAC-SHA256 of `payload` under
/// `secret`.
pub fn verify_signature(
    payload: &[u8],
    signature: &str,
    secret: &str,
) -> Result<(), SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::InvalidSecret);
    }

    let provided = parse_signature(signature)?;
    let expected = hmac_hex(payload, secret)?;

    if constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Computes the lowercase hex HMAC-SHA256 of `payload` under `secret`.
///
/// Exposed so tests and outbound signing can produce valid signatures.
pub fn hmac_hex(payload: &[u8], secret: &str) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Strips the accepted header formats down to the bare hex digest.
fn parse_signature(signature: &str) -> Result<String, SignatureError> {
    if let Some(hex) = signature.strip_prefix("sha256=") {
        return Ok(hex.to_ascii_lowercase());
    }
    if let Some(hex) = signature.strip_prefix("v1=") {
        return Ok(hex.to_ascii_lowercase());
    }
    if signature.len() == 64 && signature.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(signature.to_ascii_lowercase());
    }

    Err(SignatureError::InvalidFormat(
        "expected 'sha256=<hex>', 'v1=<hex>', or 64-char hex".to_string(),
    ))
}

/// Constant-time byte comparison.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn accepts_all_three_header_formats() {
        let payload = b"{\"id\":\"evt_1\"}";
        let secret = "whsec_test";
        let digest = hmac_hex(payload, secret).unwrap();

        for header in [format!("sha256={digest}"), format!("v1={digest}"), digest.clone()] {
            assert_eq!(verify_signature(payload, &header, secret), Ok(()));
        }
    }

    #[test]
    fn uppercase_hex_is_normalized() {
        let payload = b"payload";
        let secret = "secret";
        let digest = hmac_hex(payload, secret).unwrap().to_ascii_uppercase();

        assert_eq!(verify_signature(payload, &format!("sha256={digest}"), secret), Ok(()));
    }

    #[test]
    fn wrong_digest_is_a_mismatch() {
        let payload = b"payload";
        let other = hmac_hex(payload, "other_secret").unwrap();

        assert_eq!(
            verify_signature(payload, &format!("sha256={other}"), "secret"),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn tampered_payload_is_a_mismatch() {
        let secret = "secret";
        let digest = hmac_hex(b"original", secret).unwrap();

        assert_eq!(
            verify_signature(b"tampered", &format!("v1={digest}"), secret),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn garbage_header_is_a_format_error() {
        let err = verify_signature(b"x", "not-a-signature", "secret").unwrap_err();
        assert!(matches!(err, SignatureError::InvalidFormat(_)));
    }

    #[test]
    fn empty_secret_is_rejected() {
        let err = verify_signature(b"x", "sha256=00", "").unwrap_err();
        assert_eq!(err, SignatureError::InvalidSecret);
    }

    #[test]
    fn constant_time_eq_requires_equal_lengths() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn hmac_hex_is_deterministic() {
        let a = hmac_hex(b"payload", "secret").unwrap();
        let b = hmac_hex(b"payload", "secret").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
