//! Expiry inspection for bearer tokens
//!
//! Tokens are JWTs. Only the `exp` claim is read and the signature is never
//! checked: the server remains the authority on validity, this module just
//! decides whether a token is worth presenting. Anything that cannot be
//! decoded is treated as expired.

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

/// An opaque bearer token
pub type Token = String;

/// Why a token's expiry could not be read
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("token is empty")]
    Empty,

    #[error("malformed token: {0}")]
    Malformed(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Deserialize)]
struct ExpiryClaim {
    exp: i64,
}

/// Expiry instant of `token` in Unix seconds
pub fn expiry_of(token: &str) -> Result<i64, DecodeError> {
    if token.trim().is_empty() {
        return Err(DecodeError::Empty);
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    let data = jsonwebtoken::decode::<ExpiryClaim>(
        token,
        &DecodingKey::from_secret(&[]),
        &validation,
    )?;

    Ok(data.claims.exp)
}

/// Whether `token` is expired at `now` once `skew_seconds` of margin is applied
///
/// Fails closed: an undecodable token is always expired.
pub fn is_expired(token: &str, now: i64, skew_seconds: i64) -> bool {
    match expiry_of(token) {
        Ok(exp) => exp <= now.saturating_add(skew_seconds),
        Err(_) => true,
    }
}

/// [`is_expired`] against the system clock
pub fn is_expired_now(token: &str, skew_seconds: i64) -> bool {
    is_expired(token, now_unix(), skew_seconds)
}

/// Current Unix time in seconds
pub fn now_unix() -> i64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0));
    i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX)
}
