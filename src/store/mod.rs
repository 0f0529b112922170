//! Session store: the key-value primitives behind claim, rotation and rate limiting.
//!
//! The [`SessionBackend`] trait is the whole contract the gate needs from a
//! store: every method is a single atomic round-trip, so no client-side
//! locking is involved. Two implementations exist:
//!
//! - [`RedisBackend`]: Lua scripts evaluated server-side (production).
//! - [`MemoryBackend`]: a mutex-guarded map with the same semantics
//!   (tests and `memory://` development mode).
//!
//! # Key layout
//!
//! | Key | Type | TTL |
//! |-----|------|-----|
//! | `session:{id}` | string (refresh token) | refresh window |
//! | `session:{id}:config` | hash | mirrors `session:{id}` |
//! | `requestLimit:{id}:{sha256(identity)}` | integer | session `RequestInterval` |

mod memory;
mod redis;
mod session_config;

use std::sync::Arc;
use std::time::Duration;

pub use memory::MemoryBackend;
pub use redis::RedisBackend;
pub use session_config::SessionConfig;

/// Store failures. All of them are transient from the caller's view.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Redis connection or command failure.
    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// A script answered with something outside its sentinel set.
    #[error("unexpected store reply: {0}")]
    UnexpectedReply(String),

    /// The store URI could not be understood.
    #[error("unsupported store uri: {0}")]
    UnsupportedUri(String),
}

/// Result of an atomic claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The id was free and now holds the refresh token (`1`).
    Claimed,
    /// The id is already held (`0`).
    Taken,
}

impl TryFrom<i64> for ClaimOutcome {
    type Error = StoreError;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Claimed),
            0 => Ok(Self::Taken),
            other => Err(StoreError::UnexpectedReply(format!("claim returned {other}"))),
        }
    }
}

/// Result of an atomic refresh-token rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOutcome {
    /// No such session, or its window lapsed (`-1`).
    Missing,
    /// The presented token is not the current one (`0`).
    Mismatch,
    /// The token was replaced and the TTLs re-armed (`1`).
    Rotated,
}

impl TryFrom<i64> for RotateOutcome {
    type Error = StoreError;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        match v {
            -1 => Ok(Self::Missing),
            0 => Ok(Self::Mismatch),
            1 => Ok(Self::Rotated),
            other => Err(StoreError::UnexpectedReply(format!("rotate returned {other}"))),
        }
    }
}

/// Result of writing a session's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOutcome {
    /// The session record is gone or has no expiry; nothing was written (`-1`).
    Missing,
    /// The config was written with the session's remaining TTL (`1`).
    Stored,
}

impl TryFrom<i64> for ConfigOutcome {
    type Error = StoreError;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        match v {
            -1 => Ok(Self::Missing),
            1 => Ok(Self::Stored),
            other => Err(StoreError::UnexpectedReply(format!("config write returned {other}"))),
        }
    }
}

/// Counter state after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCount {
    /// Requests seen in the current window.
    pub count: i64,
    /// Seconds until the window resets, as the store reports it.
    pub ttl: i64,
}

/// Key for a session's refresh token.
#[must_use]
pub fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

/// Key for a session's configuration hash.
#[must_use]
pub fn config_key(session_id: &str) -> String {
    format!("session:{session_id}:config")
}

/// Key for a rate-limit counter. `identity_hash` must already be hashed.
#[must_use]
pub fn rate_key(session_id: &str, identity_hash: &str) -> String {
    format!("requestLimit:{session_id}:{identity_hash}")
}

/// Atomic store primitives.
///
/// Implementations must be `Send + Sync` because the backend is shared across
/// request tasks.
#[async_trait::async_trait]
pub trait SessionBackend: Send + Sync + 'static {
    /// Set `session:{id}` to `refresh_token` with `ttl`, only if the key is absent.
    ///
    /// A key that exists without a TTL counts as taken.
    async fn claim_session(
        &self,
        session_id: &str,
        refresh_token: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Replace `old` with `new` if `old` is current, re-arming the TTL of the
    /// session and its config.
    async fn rotate_refresh_token(
        &self,
        session_id: &str,
        old: &str,
        new: &str,
        ttl: Duration,
    ) -> Result<RotateOutcome, StoreError>;

    /// Whether `session:{id}` currently exists.
    async fn session_exists(&self, session_id: &str) -> Result<bool, StoreError>;

    /// Increment a rate counter. When the new count is at most one the TTL is
    /// (re)armed from the session's `RequestInterval`, else `default_interval`.
    async fn increment_rate(
        &self,
        session_id: &str,
        key: &str,
        default_interval: Duration,
    ) -> Result<RateCount, StoreError>;

    /// Decrement a rate counter if it still exists. Returns the new count
    /// (zero when the counter had already expired).
    async fn decrement_rate(&self, key: &str) -> Result<i64, StoreError>;

    /// Write a session's configuration in one atomic step. The config takes
    /// the remaining TTL of `session:{id}` so it never outlives the session.
    async fn set_config(
        &self,
        session_id: &str,
        config: &SessionConfig,
    ) -> Result<ConfigOutcome, StoreError>;

    /// Read a session's configuration, `None` if absent.
    async fn get_config(&self, session_id: &str) -> Result<Option<SessionConfig>, StoreError>;
}

/// Open a backend for `uri`.
///
/// `memory://` selects the in-process backend; `redis://` and `rediss://`
/// connect to Redis.
pub async fn connect(uri: &str) -> Result<Arc<dyn SessionBackend>, StoreError> {
    if uri.starts_with("memory://") {
        tracing::warn!("Using in-memory session store, state is lost on restart");
        return Ok(Arc::new(MemoryBackend::new()));
    }
    if uri.starts_with("redis://") || uri.starts_with("rediss://") {
        return Ok(Arc::new(RedisBackend::connect(uri).await?));
    }
    Err(StoreError::UnsupportedUri(uri.to_string()))
}

/// Whole seconds for a TTL argument, never below one.
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
