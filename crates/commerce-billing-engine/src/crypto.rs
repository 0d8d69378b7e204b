//! Webhook signing and verification.
//!
//! Deliveries carry a `Commerce-Signature: t=<unix-seconds>,v1=<hex>` header where the hex
//! value is HMAC-SHA256 of `"<t>.<body>"` keyed with the endpoint secret. Receivers call
//! [`verify_webhook_signature`] with the raw body.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use commerce_billing_core::{BillingError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the delivery signature.
pub const SIGNATURE_HEADER: &str = "Commerce-Signature";

/// Hex-encoded HMAC-SHA256 of `message` keyed with `secret`.
///
/// # Panics
///
/// Never: HMAC accepts keys of any length (RFC 2104).
#[must_use]
pub fn hmac_sha256_hex(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC-SHA256 accepts any key size");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Compare two signatures without short-circuiting on the first differing byte.
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

/// Generate a fresh endpoint secret (`whsec_` + 32 hex chars).
#[must_use]
pub fn generate_webhook_secret() -> String {
    format!("whsec_{}", uuid::Uuid::new_v4().simple())
}

/// Build the signature header value for `payload` at `timestamp`.
#[must_use]
pub fn sign_payload(secret: &str, payload: &str, timestamp: i64) -> String {
    let signature = hmac_sha256_hex(secret, &format!("{timestamp}.{payload}"));
    format!("t={timestamp},v1={signature}")
}

/// Parsed signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<String>,
}

fn parse_header(header: &str) -> Result<SignatureHeader> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                timestamp = Some(value.parse::<i64>().map_err(|_| {
                    BillingError::SignatureFormat(format!("invalid timestamp: {value}"))
                })?);
            }
            "v1" => signatures.push(value.to_string()),
            _ => {}
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| BillingError::SignatureFormat("missing timestamp (t=)".into()))?;
    if signatures.is_empty() {
        return Err(BillingError::SignatureFormat("missing signature (v1=)".into()));
    }
    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

/// Verify a delivery against its signature header.
///
/// # Errors
///
/// - `SignatureFormat` if the header lacks `t=` or `v1=`.
/// - `SignatureMismatch` if no `v1` signature matches the payload.
pub fn verify_webhook_signature(payload: &str, header: &str, secret: &str) -> Result<()> {
    let parsed = parse_header(header)?;
    let expected = hmac_sha256_hex(secret, &format!("{}.{payload}", parsed.timestamp));
    if parsed
        .signatures
        .iter()
        .any(|candidate| constant_time_eq(candidate, &expected))
    {
        Ok(())
    } else {
        Err(BillingError::SignatureMismatch)
    }
}

/// Verify a delivery and reject timestamps further than `tolerance` from `now`.
///
/// # Errors
///
/// As [`verify_webhook_signature`], plus `SignatureMismatch` for a stale timestamp.
pub fn verify_webhook_signature_with_tolerance(
    payload: &str,
    header: &str,
    secret: &str,
    tolerance: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<()> {
    verify_webhook_signature(payload, header, secret)?;
    let timestamp = parse_header(header)?.timestamp;
    if (now.timestamp() - timestamp).abs() > tolerance.num_seconds() {
        tracing::debug!(timestamp, "Webhook signature outside tolerance");
        return Err(BillingError::SignatureMismatch);
    }
    Ok(())
}
