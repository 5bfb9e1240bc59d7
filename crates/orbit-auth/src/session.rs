//! Expiry-aware session context.
//!
//! A [`Session`] is created once per process and handed to every component
//! that talks to the control plane. Readers take the cached token under a
//! `parking_lot` read lock; renewals are serialised by an async mutex so that
//! concurrent callers never issue duplicate logins.

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::client::{TokenClient, Tokens};
use crate::error::{AuthError, Result};
use crate::AuthConfig;

/// Shared control-plane session.
pub struct Session {
    client: TokenClient,
    tokens: RwLock<Option<Tokens>>,
    renew_lock: Mutex<()>,
}

impl Session {
    /// Create a session. No request is made until a token is first needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be constructed.
    pub fn new(config: AuthConfig) -> Result<Self> {
        Ok(Self::with_client(TokenClient::new(config)?))
    }

    /// Create a session around an existing token client.
    #[must_use]
    pub fn with_client(client: TokenClient) -> Self {
        Self {
            client,
            tokens: RwLock::new(None),
            renew_lock: Mutex::new(()),
        }
    }

    /// Get a usable access token, renewing it if it is close to expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if both refresh and login fail.
    pub async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.fresh_token() {
            return Ok(token);
        }

        let _guard = self.renew_lock.lock().await;

        // Another caller may have renewed while we waited
        if let Some(token) = self.fresh_token() {
            return Ok(token);
        }

        self.renew().await
    }

    /// Force a renewal after the control plane rejected the current token.
    ///
    /// # Errors
    ///
    /// Returns an error if both refresh and login fail.
    pub async fn reauthenticate(&self) -> Result<()> {
        let _guard = self.renew_lock.lock().await;
        self.renew().await.map(|_| ())
    }

    /// Drop the cached token so the next call logs in again.
    pub fn invalidate(&self) {
        *self.tokens.write() = None;
    }

    /// Expiry of the cached token, if any.
    #[must_use]
    pub fn expires_at(&self) -> Option<chrono::DateTime<Utc>> {
        self.tokens.read().as_ref().map(|t| t.expires_at)
    }

    fn fresh_token(&self) -> Option<String> {
        let skew = self.client.config().refresh_skew();
        self.tokens
            .read()
            .as_ref()
            .filter(|t| t.is_fresh(Utc::now(), skew))
            .map(|t| t.access_token.clone())
    }

    /// Renew the token pair. Must be called with `renew_lock` held.
    async fn renew(&self) -> Result<String> {
        let refresh_token = self
            .tokens
            .read()
            .as_ref()
            .and_then(|t| t.refresh_token.clone());

        let tokens = match refresh_token {
            Some(id) => match self.client.refresh(&id).await {
                Ok(tokens) => tokens,
                Err(AuthError::RefreshRejected) => {
                    tracing::debug!("Refresh token rejected, logging in again");
                    self.client.login().await?
                }
                Err(e) => return Err(e),
            },
            None => self.client.login().await?,
        };

        tracing::info!(expires_at = %tokens.expires_at, "Control-plane session renewed");

        let access_token = tokens.access_token.clone();
        *self.tokens.write() = Some(tokens);
        Ok(access_token)
    }
}
