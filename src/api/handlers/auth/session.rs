//! Signed session tokens.
//!
//! Stateless HS256 JWTs carrying the account id and email with a fixed
//! short expiry. Verification needs only the signing secret, never a
//! database round-trip; tampered payloads and expired tokens are rejected.

use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionClaims {
    pub sub: i64,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("token expired")]
    Expired,
    #[error("invalid token")]
    Invalid,
    #[error("failed to sign token")]
    Signing,
}

fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Issue a session token for a freshly authenticated account.
///
/// # Errors
///
/// Returns an error if claim serialization or signing fails.
pub fn issue(
    secret: &SecretString,
    account_id: i64,
    email: &str,
    ttl_seconds: i64,
) -> Result<String, Error> {
    let now = now_unix_seconds();
    let claims = SessionClaims {
        sub: account_id,
        email: email.to_string(),
        iat: now,
        exp: now.saturating_add(ttl_seconds),
    };

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.expose_secret().as_bytes()),
    )
    .map_err(|_| Error::Signing)
}

/// Verify a session token and return its claims.
///
/// # Errors
///
/// Returns [`Error::Expired`] for tokens past their `exp` and
/// [`Error::Invalid`] for every other failure (tampered payload, wrong
/// secret, malformed token) so callers cannot distinguish them.
pub fn verify(secret: &SecretString, token: &str) -> Result<SessionClaims, Error> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;

    decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(secret.expose_secret().as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|err| match err.kind() {
        ErrorKind::ExpiredSignature => Error::Expired,
        _ => Error::Invalid,
    })
}
