//! HMAC-SHA256 verification of inbound WA webhooks.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureVerdict {
    Valid,
    Invalid,
    /// No secret is configured for the instance: explicit unsecured mode,
    /// every payload is accepted and the verdict is recorded in the audit log.
    Unsigned,
}

impl SignatureVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Unsigned => "unsigned",
        }
    }

    pub fn accepted(&self) -> bool {
        matches!(self, Self::Valid | Self::Unsigned)
    }
}

/// Verify `signature_header` against an HMAC-SHA256 of the raw payload.
///
/// The header may be a bare hex digest or carry a `sha256=` prefix; both
/// provider conventions are accepted. Comparison is constant-time via
/// `Mac::verify_slice`.
pub fn verify(
    raw_body: &[u8],
    signature_header: Option<&str>,
    secret: Option<&str>,
) -> SignatureVerdict {
    let Some(secret) = secret.filter(|value| !value.is_empty()) else {
        return SignatureVerdict::Unsigned;
    };
    let Some(header) = signature_header else {
        return SignatureVerdict::Invalid;
    };

    let digest_hex = header.strip_prefix("sha256=").unwrap_or(header).trim();
    let Ok(claimed) = hex::decode(digest_hex) else {
        return SignatureVerdict::Invalid;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return SignatureVerdict::Invalid;
    };
    mac.update(raw_body);

    match mac.verify_slice(&claimed) {
        Ok(()) => SignatureVerdict::Valid,
        Err(_) => SignatureVerdict::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    use super::{verify, SignatureVerdict};

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn correct_signature_is_accepted_in_both_header_forms() {
        let secret = "instance-secret-0123456789abcdef";
        let body = br#"{"event":"messages.upsert"}"#;
        let digest = sign(secret, body);

        assert_eq!(verify(body, Some(&digest), Some(secret)), SignatureVerdict::Valid);
        assert_eq!(
            verify(body, Some(&format!("sha256={digest}")), Some(secret)),
            SignatureVerdict::Valid
        );
    }

    #[test]
    fn tampered_body_fails_against_the_original_signature() {
        let secret = "instance-secret-0123456789abcdef";
        let original = br#"{"text":"pay me 10"}"#;
        let tampered = br#"{"text":"pay me 1000"}"#;
        let digest = sign(secret, original);

        assert_eq!(verify(tampered, Some(&digest), Some(secret)), SignatureVerdict::Invalid);
    }

    #[test]
    fn missing_header_or_bad_hex_is_rejected_when_secret_is_set() {
        let secret = "instance-secret-0123456789abcdef";
        let body = b"payload";

        assert_eq!(verify(body, None, Some(secret)), SignatureVerdict::Invalid);
        assert_eq!(
            verify(body, Some("not-hex-at-all"), Some(secret)),
            SignatureVerdict::Invalid
        );
    }

    #[test]
    fn missing_secret_accepts_any_signature_state() {
        let body = b"payload";

        assert_eq!(verify(body, None, None), SignatureVerdict::Unsigned);
        assert_eq!(verify(body, Some("deadbeef"), None), SignatureVerdict::Unsigned);
        assert_eq!(verify(body, Some("deadbeef"), Some("")), SignatureVerdict::Unsigned);
        assert!(SignatureVerdict::Unsigned.accepted());
    }
}
