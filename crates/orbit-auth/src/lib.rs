//! Control-plane session management for orbit.
//!
//! This crate owns the one piece of process-wide shared state in orbit: the
//! control-plane access token. It provides:
//!
//! - [`TokenClient`]: issues and refreshes tokens against the control plane
//! - [`Session`]: an explicitly passed session context that caches the access
//!   token and refreshes it shortly before it expires
//! - Expiry extraction from JWT access tokens
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────────┐
//! │  Control-plane   │────▶│     Session      │
//! │  HTTP client     │     │  (token cache)   │
//! └──────────────────┘     └────────┬─────────┘
//!                                   │
//!                          ┌────────▼─────────┐
//!                          │   TokenClient    │
//!                          └────────┬─────────┘
//!                                   │ HTTPS
//!                          ┌────────▼─────────┐
//!                          │  /v1/tokens      │
//!                          └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use orbit_auth::{AuthConfig, Session};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AuthConfig::new("https://cp.example.com", "admin@local", "secret");
//! let session = Session::new(config)?;
//!
//! // Fetches a token on first use and refreshes it near expiry
//! let token = session.access_token().await?;
//! println!("bearer {token}");
//!
//! // Called by the control-plane client after a 401
//! session.reauthenticate().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod error;
pub mod session;
pub mod token;

use std::fmt;
use std::time::Duration;

pub use client::{LoginRequest, TokenClient, Tokens};
pub use error::{AuthError, Result};
pub use session::Session;

/// Configuration for authenticating against the control plane.
#[derive(Clone)]
pub struct AuthConfig {
    /// Base URL of the control plane (e.g., `https://cp.example.com`).
    pub base_url: String,
    /// Service account user name.
    pub username: String,
    /// Service account password.
    pub password: String,
    /// Refresh the access token this many seconds before it expires.
    pub refresh_skew_seconds: u64,
    /// Lifetime assumed for access tokens that carry no `exp` claim.
    pub default_token_ttl_seconds: u64,
}

impl AuthConfig {
    /// Create a configuration with default refresh settings.
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Get the token issue endpoint URL.
    #[must_use]
    pub fn tokens_url(&self) -> String {
        format!("{}/v1/tokens", self.base_url)
    }

    /// Get the access-token refresh endpoint URL.
    #[must_use]
    pub fn refresh_url(&self) -> String {
        format!("{}/v1/tokens/access-token/refresh", self.base_url)
    }

    /// Get the refresh skew as a `Duration`.
    #[must_use]
    pub const fn refresh_skew(&self) -> Duration {
        Duration::from_secs(self.refresh_skew_seconds)
    }

    /// Get the fallback token lifetime as a `Duration`.
    #[must_use]
    pub const fn default_token_ttl(&self) -> Duration {
        Duration::from_secs(self.default_token_ttl_seconds)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            base_url: "https://localhost".to_string(),
            username: String::new(),
            password: String::new(),
            refresh_skew_seconds: 60,
            default_token_ttl_seconds: 3600,
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("refresh_skew_seconds", &self.refresh_skew_seconds)
            .field("default_token_ttl_seconds", &self.default_token_ttl_seconds)
            .finish()
    }
}
