//! Authentication error types.

use thiserror::Error;

/// A result type using `AuthError`.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Errors that can occur while obtaining or refreshing a session token.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The control plane rejected the service account credentials.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The refresh token was rejected; a full login is required.
    #[error("refresh token rejected")]
    RefreshRejected,

    /// Too many authentication attempts, rate limited.
    #[error("rate limited")]
    RateLimited,

    /// The token response could not be understood.
    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    /// The HTTP request could not be completed.
    #[error("request failed: {0}")]
    Request(String),

    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Returns `true` if repeating the same call later might succeed.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Request(_))
    }
}
