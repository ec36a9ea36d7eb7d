//! Timestamped HMAC-SHA256 signatures for completion callbacks.
//!
//! Every delivery signs the canonical string `"{unixTimestamp}.{jsonBody}"`
//! with the task's per-task secret. The timestamp is taken at send time so
//! the receiver's replay window measures the actual attempt, not the first
//! one. Receivers reject timestamps more than 15 minutes away from their
//! own clock (symmetric, to tolerate skew in either direction) and compare
//! signatures in constant time.
//!
//! Heartbeats use the same primitive without a timestamp: an HMAC over the
//! raw JSON body keyed by the shared worker secret.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Replay window: timestamps further than this from the receiver's clock
/// are rejected.
pub const REPLAY_WINDOW_SECS: i64 = 15 * 60;

/// Signature verification failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    /// The timestamp is outside the replay window.
    #[error("timestamp {timestamp} outside the replay window")]
    TimestampOutOfRange { timestamp: i64 },

    /// The signature is malformed or does not match.
    #[error("invalid signature")]
    InvalidSignature,
}

/// Computes the hex HMAC-SHA256 signature over `"{timestamp}.{body}"`.
pub fn sign_with_timestamp(secret: &[u8], timestamp: i64, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Computes the hex HMAC-SHA256 signature over a raw body (no timestamp).
///
/// Used for heartbeat batches, which are signed with the shared worker
/// secret rather than a per-task secret.
pub fn sign_body(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a timestamped callback signature.
///
/// Order matters: the replay window is checked before any HMAC work so an
/// attacker replaying an old capture learns nothing about the secret.
///
/// # Errors
///
/// `TimestampOutOfRange` if `timestamp` is more than 15 minutes from `now`
/// in either direction; `InvalidSignature` for malformed hex, length
/// mismatch, or a failed constant-time comparison.
pub fn verify_with_timestamp(
    secret: &[u8],
    timestamp: i64,
    body: &[u8],
    signature_hex: &str,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let skew = (now.timestamp() - timestamp).abs();
    if skew > REPLAY_WINDOW_SECS {
        return Err(SignatureError::TimestampOutOfRange { timestamp });
    }

    let supplied = hex::decode(signature_hex).map_err(|_| SignatureError::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);

    // verify_slice is constant-time and rejects length mismatches.
    mac.verify_slice(&supplied)
        .map_err(|_| SignatureError::InvalidSignature)
}

/// Verifies an untimestamped body signature (heartbeats).
pub fn verify_body(secret: &[u8], body: &[u8], signature_hex: &str) -> bool {
    let supplied = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&supplied).is_ok()
}

/// Convenience guard for replay-window math in tests and handlers.
pub fn within_replay_window(timestamp: i64, now: DateTime<Utc>) -> bool {
    (now.timestamp() - timestamp).abs() <= REPLAY_WINDOW_SECS
}
