//! Access-token expiry extraction.
//!
//! Control-plane access tokens are usually JWTs. Orbit only needs to know when
//! a token expires so it can refresh ahead of time; the control plane remains
//! the authority on validity, so the signature is not checked here.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ExpiryClaims {
    #[serde(default)]
    exp: Option<i64>,
}

/// Read the `exp` claim from a JWT access token.
///
/// Returns `None` for opaque (non-JWT) tokens and for JWTs without `exp`.
#[must_use]
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<ExpiryClaims>(token, &DecodingKey::from_secret(&[]), &validation).ok()?;
    DateTime::from_timestamp(data.claims.exp?, 0)
}

/// Compute when a freshly issued token expires.
///
/// Falls back to `now + default_ttl` when the token carries no expiry.
#[must_use]
pub fn expires_at(token: &str, now: DateTime<Utc>, default_ttl: Duration) -> DateTime<Utc> {
    jwt_expiry(token).unwrap_or_else(|| {
        now + chrono::Duration::from_std(default_ttl).unwrap_or(chrono::Duration::zero())
    })
}
