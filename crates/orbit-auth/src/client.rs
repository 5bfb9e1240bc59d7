//! Control-plane token client for login and access-token refresh.
//!
//! The control plane issues a short-lived access token together with a
//! refresh-token id. The refresh endpoint takes the id as a bare JSON string
//! and answers with the new access token as a bare JSON string.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, Result};
use crate::{token, AuthConfig};

/// Request payload for username/password login.
#[derive(Clone, Serialize)]
pub struct LoginRequest {
    /// Service account user name.
    pub username: String,
    /// Service account password.
    pub password: String,
}

/// A token pair held by a session.
#[derive(Debug, Clone)]
pub struct Tokens {
    /// Bearer access token.
    pub access_token: String,
    /// Refresh-token id, if the control plane issued one.
    pub refresh_token: Option<String>,
    /// When the access token expires.
    pub expires_at: DateTime<Utc>,
}

impl Tokens {
    /// Returns `true` if the access token is still usable for at least `skew`.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        let skew = chrono::Duration::from_std(skew).unwrap_or(chrono::Duration::zero());
        now + skew < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTokenPair {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<RawRefreshToken>,
}

#[derive(Debug, Deserialize)]
struct RawRefreshToken {
    id: String,
}

/// Client for the control-plane token endpoints.
pub struct TokenClient {
    config: AuthConfig,
    client: reqwest::Client,
}

impl TokenClient {
    /// Create a new token client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: AuthConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AuthError::Internal(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    /// Get the configuration this client was built with.
    #[must_use]
    pub const fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Issue a new token pair with the configured credentials.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCredentials` on 401/403, `RateLimited` on 429, and
    /// `Request` or `InvalidResponse` for transport and decoding failures.
    pub async fn login(&self) -> Result<Tokens> {
        let req = LoginRequest {
            username: self.config.username.clone(),
            password: self.config.password.clone(),
        };

        let response = self
            .client
            .post(self.config.tokens_url())
            .json(&req)
            .send()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                401 | 403 => AuthError::InvalidCredentials,
                429 => AuthError::RateLimited,
                _ => AuthError::Request(format!("HTTP {status}")),
            });
        }

        let raw: RawTokenPair = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;

        tracing::debug!(username = %self.config.username, "Issued control-plane token");

        Ok(Tokens {
            expires_at: self.expiry_of(&raw.access_token),
            access_token: raw.access_token,
            refresh_token: raw.refresh_token.map(|r| r.id),
        })
    }

    /// Exchange a refresh-token id for a new access token.
    ///
    /// # Errors
    ///
    /// Returns `RefreshRejected` on 400/401/403/404, meaning a full login is
    /// needed, `RateLimited` on 429, and `Request` or `InvalidResponse`
    /// otherwise.
    pub async fn refresh(&self, refresh_token: &str) -> Result<Tokens> {
        let response = self
            .client
            .patch(self.config.refresh_url())
            .json(&refresh_token)
            .send()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                400 | 401 | 403 | 404 => AuthError::RefreshRejected,
                429 => AuthError::RateLimited,
                _ => AuthError::Request(format!("HTTP {status}")),
            });
        }

        let access_token: String = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;

        Ok(Tokens {
            expires_at: self.expiry_of(&access_token),
            access_token,
            refresh_token: Some(refresh_token.to_string()),
        })
    }

    fn expiry_of(&self, access_token: &str) -> DateTime<Utc> {
        token::expires_at(access_token, Utc::now(), self.config.default_token_ttl())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> TokenClient {
        TokenClient::new(AuthConfig::new(server.uri(), "svc-orbit", "secret")).unwrap()
    }

    #[test]
    fn login_request_serializes() {
        let req = LoginRequest {
            username: "svc-orbit".to_string(),
            password: "secret".to_string(),
        };

        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, json!({"username": "svc-orbit", "password": "secret"}));
    }

    #[test]
    fn freshness_honours_skew() {
        let now = Utc::now();
        let tokens = Tokens {
            access_token: "t".to_string(),
            refresh_token: None,
            expires_at: now + chrono::Duration::seconds(90),
        };
        assert!(tokens.is_fresh(now, Duration::from_secs(60)));
        assert!(!tokens.is_fresh(now, Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn login_returns_token_pair() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/tokens"))
            .and(body_json(json!({"username": "svc-orbit", "password": "secret"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessToken": "access-1",
                "refreshToken": {"id": "refresh-1"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = client_for(&server).login().await.unwrap();
        assert_eq!(tokens.access_token, "access-1");
        assert_eq!(tokens.refresh_token.as_deref(), Some("refresh-1"));
        assert!(tokens.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn login_maps_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/tokens"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client_for(&server).login().await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn refresh_sends_bare_id() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/v1/tokens/access-token/refresh"))
            .and(body_json(json!("refresh-1")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!("access-2")))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = client_for(&server).refresh("refresh-1").await.unwrap();
        assert_eq!(tokens.access_token, "access-2");
        assert_eq!(tokens.refresh_token.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn refresh_rejection_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/v1/tokens/access-token/refresh"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client_for(&server).refresh("stale").await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshRejected));
    }
}
