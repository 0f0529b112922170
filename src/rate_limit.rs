//! Per-(session, identity) rate limiting with compensating reversal.
//!
//! An admitted call that later fails for reasons outside the caller's control
//! (inactive session, relay failure) is given back with [`RateLimiter::reverse`].

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::store::{SessionBackend, rate_key};
use crate::{Error, Result};

/// Counter state of an admitted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Count after this call.
    pub count: i64,
    /// Seconds left in the window.
    pub ttl: i64,
}

/// Rate limiter over the session store.
pub struct RateLimiter {
    backend: Arc<dyn SessionBackend>,
    default_interval: Duration,
}

/// Hex SHA-256 of an identity. Raw identities never reach the store or the logs.
#[must_use]
pub fn identity_hash(identity: &str) -> String {
    hex::encode(Sha256::digest(identity.as_bytes()).as_slice())
}

impl RateLimiter {
    /// Create a limiter. `default_interval` applies to sessions without a
    /// configured `requestInterval`.
    #[must_use]
    pub fn new(backend: Arc<dyn SessionBackend>, default_interval: Duration) -> Self {
        Self {
            backend,
            default_interval,
        }
    }

    /// Count a call from `identity` against `session_id`.
    ///
    /// # Errors
    ///
    /// [`Error::RateLimited`] when the identity already called in this window.
    pub async fn admit(&self, session_id: &str, identity: &str) -> Result<Admission> {
        let key = rate_key(session_id, &identity_hash(identity));
        let state = self
            .backend
            .increment_rate(session_id, &key, self.default_interval)
            .await?;
        if state.count > 1 {
            debug!(session = %session_id, count = state.count, ttl = state.ttl, "Rate limited");
            return Err(Error::RateLimited {
                retry_after: state.ttl.max(0),
            });
        }
        Ok(Admission {
            count: state.count,
            ttl: state.ttl,
        })
    }

    /// Give back a previously admitted call.
    pub async fn reverse(&self, session_id: &str, identity: &str) -> Result<()> {
        let key = rate_key(session_id, &identity_hash(identity));
        let count = self.backend.decrement_rate(&key).await?;
        debug!(session = %session_id, count, "Rate limit reversed");
        Ok(())
    }
}
