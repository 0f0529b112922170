//! Error types for the session gate

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

use crate::identity::{IdentityError, IdentityRejection};
use crate::pow::PowRejection;
use crate::store::StoreError;
use crate::token::TokenRejection;

/// Result type alias for the session gate
pub type Result<T> = std::result::Result<T, Error>;

/// Session gate errors.
///
/// Variants fall into four groups: client input errors, admission
/// rejections, transient dependency failures and resource exhaustion.
/// [`Error::status`] and [`Error::code`] map each to its HTTP surface.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or incomplete request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Proof-of-work verification failed
    #[error("Proof of work rejected: {0}")]
    Pow(#[from] PowRejection),

    /// The claimed session id is already taken
    #[error("Session code taken: {0}")]
    SessionTaken(String),

    /// Session token rejected
    #[error("Session token rejected: {0}")]
    SessionToken(#[from] TokenRejection),

    /// Refresh token did not match the stored one
    #[error("Invalid refresh token")]
    RefreshMismatch,

    /// Session no longer exists (refresh window lapsed)
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Third-party bearer token rejected
    #[error("Identity rejected: {0}")]
    Identity(#[from] IdentityRejection),

    /// Rate limit exceeded for this (session, identity)
    #[error("Rate limited, retry after {retry_after}s")]
    RateLimited {
        /// Seconds until the window resets
        retry_after: i64,
    },

    /// Target session has no active listeners on the relay
    #[error("Inactive session: {0}")]
    InactiveSession(String),

    /// No stored config for a session
    #[error("No config for {0}")]
    ConfigNotFound(String),

    /// Feature disabled by configuration
    #[error("Not configured: {0}")]
    NotConfigured(&'static str),

    /// Key-value store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Key-set fetch failure
    #[error("Key set error: {0}")]
    KeySet(#[from] IdentityError),

    /// Relay answered with an error status
    #[error("Relay returned status {0}")]
    RelayStatus(u16),

    /// Relay did not answer in time
    #[error("Relay timeout after {0:?}")]
    RelayTimeout(std::time::Duration),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Candidate id allocation gave up after bounded retries
    #[error("Out of session ids after {0} attempts")]
    OutOfSessionIds(u32),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_)
            | Self::Pow(_)
            | Self::RefreshMismatch
            | Self::InactiveSession(_) => StatusCode::BAD_REQUEST,
            Self::SessionToken(_) | Self::Identity(_) => StatusCode::UNAUTHORIZED,
            Self::SessionTaken(_) | Self::SessionExpired(_) => StatusCode::GONE,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ConfigNotFound(_) => StatusCode::NOT_FOUND,
            Self::NotConfigured(_) | Self::OutOfSessionIds(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RelayStatus(_) | Self::Http(_) | Self::KeySet(_) => StatusCode::BAD_GATEWAY,
            Self::RelayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Config(_) | Self::Store(_) | Self::Io(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable error code for response bodies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Pow(r) => r.code(),
            Self::SessionTaken(_) => "code_taken",
            Self::SessionToken(r) => r.code(),
            Self::RefreshMismatch => "invalid_refresh_token",
            Self::SessionExpired(_) => "session_expired",
            Self::Identity(r) => r.code(),
            Self::RateLimited { .. } => "rate_limited",
            Self::InactiveSession(_) => "inactive_session",
            Self::ConfigNotFound(_) => "config_not_found",
            Self::NotConfigured(_) => "not_configured",
            Self::OutOfSessionIds(_) => "out_of_session_ids",
            Self::RelayStatus(_) | Self::RelayTimeout(_) | Self::Http(_) => "relay_unavailable",
            Self::KeySet(_) => "key_set_unavailable",
            Self::Config(_) | Self::Store(_) | Self::Io(_) | Self::Internal(_) => "internal",
        }
    }

    /// Whether a caller may retry the same request later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store(_)
                | Self::KeySet(_)
                | Self::RelayStatus(_)
                | Self::RelayTimeout(_)
                | Self::Http(_)
                | Self::Io(_)
        )
    }
}
