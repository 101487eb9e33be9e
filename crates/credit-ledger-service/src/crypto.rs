//! Cryptographic utilities for webhook verification.
//!
//! Gateway signatures use the `t=timestamp,v1=signature[,v1=...]` header
//! format. The signed message is `"{timestamp}.{payload}"` and each `v1`
//! value is a hex HMAC-SHA256 of it under the shared webhook secret.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use credit_ledger_core::{CreditError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Compute HMAC-SHA256 and return the hex-encoded result (64 characters).
///
/// # Errors
///
/// Returns [`CreditError::Configuration`] if the key is rejected, which
/// HMAC-SHA256 never does for any key length.
pub fn hmac_sha256_hex(secret: &str, message: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| CreditError::Configuration(format!("invalid webhook secret: {e}")))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time string comparison to prevent timing attacks.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// A parsed signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader<'a> {
    /// Signing timestamp (Unix seconds).
    pub timestamp: i64,
    /// Candidate `v1` signatures.
    pub signatures: Vec<&'a str>,
}

impl<'a> SignatureHeader<'a> {
    /// Parse `t=...,v1=...` into its parts.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::InvalidSignature`] when the timestamp is missing
    /// or malformed, or there is no `v1` entry.
    pub fn parse(header: &'a str) -> Result<Self> {
        let mut timestamp: Option<&str> = None;
        let mut signatures: Vec<&str> = Vec::new();

        for part in header.split(',') {
            let mut kv = part.trim().splitn(2, '=');
            match (kv.next(), kv.next()) {
                (Some("t"), Some(ts)) => timestamp = Some(ts),
                (Some("v1"), Some(sig)) => signatures.push(sig),
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| CreditError::InvalidSignature("missing timestamp".into()))?
            .parse()
            .map_err(|_| CreditError::InvalidSignature("malformed timestamp".into()))?;
        if signatures.is_empty() {
            return Err(CreditError::InvalidSignature("missing v1 signature".into()));
        }
        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

/// Build a signature header for `payload` (for tests and local tooling).
///
/// # Errors
///
/// See [`hmac_sha256_hex`].
pub fn sign_payload(secret: &str, timestamp: i64, payload: &str) -> Result<String> {
    let signature = hmac_sha256_hex(secret, &format!("{timestamp}.{payload}"))?;
    Ok(format!("t={timestamp},v1={signature}"))
}

/// Verify a webhook payload against its signature header.
///
/// Fails closed: a missing secret rejects every payload.
///
/// # Errors
///
/// Returns [`CreditError::InvalidSignature`] when no secret is configured,
/// the header is malformed, the timestamp is outside `tolerance_seconds` of
/// `now`, or no `v1` signature matches.
pub fn verify_signature(
    secret: Option<&str>,
    payload: &str,
    header: &str,
    tolerance_seconds: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let secret = secret
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CreditError::InvalidSignature("webhook secret not configured".into()))?;
    let header = SignatureHeader::parse(header)?;

    if tolerance_seconds > 0
        && now.timestamp().abs_diff(header.timestamp) > tolerance_seconds.unsigned_abs()
    {
        return Err(CreditError::InvalidSignature(format!(
            "timestamp {} outside tolerance of {tolerance_seconds}s",
            header.timestamp
        )));
    }

    let expected = hmac_sha256_hex(secret, &format!("{}.{payload}", header.timestamp))?;
    if header
        .signatures
        .iter()
        .any(|sig| constant_time_eq(&expected, sig))
    {
        Ok(())
    } else {
        Err(CreditError::InvalidSignature("no matching v1 signature".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    #[test]
    fn hmac_sha256_produces_correct_length() {
        let result = hmac_sha256_hex("key", "The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(result.len(), 64); // SHA256 = 32 bytes = 64 hex chars
        assert_eq!(
            result,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn constant_time_eq_compares_exactly() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(constant_time_eq("", ""));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
        assert!(!constant_time_eq("abc", "ABC"));
    }

    #[test]
    fn accepts_valid_signature() {
        let now = Utc::now();
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign_payload(SECRET, now.timestamp(), payload).unwrap();
        verify_signature(Some(SECRET), payload, &header, 300, now).unwrap();
    }

    #[test]
    fn accepts_any_matching_v1() {
        let now = Utc::now();
        let payload = "{}";
        let good = sign_payload(SECRET, now.timestamp(), payload).unwrap();
        let header = format!("t={},v1=deadbeef,{}", now.timestamp(), &good[good.find("v1").unwrap()..]);
        verify_signature(Some(SECRET), payload, &header, 300, now).unwrap();
    }

    #[test]
    fn rejects_tampered_payload_and_wrong_secret() {
        let now = Utc::now();
        let header = sign_payload(SECRET, now.timestamp(), "{}").unwrap();
        assert!(matches!(
            verify_signature(Some(SECRET), "{ }", &header, 300, now),
            Err(CreditError::InvalidSignature(_))
        ));
        assert!(verify_signature(Some("whsec_other"), "{}", &header, 300, now).is_err());
    }

    #[test]
    fn fails_closed_without_secret() {
        let now = Utc::now();
        let header = sign_payload(SECRET, now.timestamp(), "{}").unwrap();
        assert!(verify_signature(None, "{}", &header, 300, now).is_err());
        assert!(verify_signature(Some(""), "{}", &header, 300, now).is_err());
    }

    #[test]
    fn rejects_stale_and_malformed_headers() {
        let now = Utc::now();
        let stale = sign_payload(SECRET, now.timestamp() - 301, "{}").unwrap();
        assert!(verify_signature(Some(SECRET), "{}", &stale, 300, now).is_err());
        // Tolerance 0 disables the age check.
        verify_signature(Some(SECRET), "{}", &stale, 0, now).unwrap();

        for extreme in [i64::MIN, i64::MAX] {
            let header = sign_payload(SECRET, extreme, "{}").unwrap();
            assert!(matches!(
                verify_signature(Some(SECRET), "{}", &header, 300, now),
                Err(CreditError::InvalidSignature(_))
            ));
        }

        assert!(SignatureHeader::parse("v1=abc").is_err());
        assert!(SignatureHeader::parse("t=abc,v1=abc").is_err());
        assert!(SignatureHeader::parse("t=1").is_err());
    }
}
