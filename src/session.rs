//! Session lifecycle: candidate allocation, claim, refresh rotation, config.
//!
//! ```text
//! Unclaimed ──claim──▶ Claimed ──rotate──▶ Claimed' ──TTL──▶ Expired
//! ```

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::store::{ClaimOutcome, ConfigOutcome, RotateOutcome, SessionBackend, SessionConfig};
use crate::token::SessionTokenCodec;
use crate::{Error, Result};

/// Characters a session code is drawn from.
pub const SESSION_CODE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789-";

/// Session code length.
pub const SESSION_CODE_LEN: usize = 5;

/// Refresh token length.
pub const REFRESH_TOKEN_LEN: usize = 64;

/// Candidate ids tried before giving up.
pub const MAX_ALLOCATION_ATTEMPTS: u32 = 10;

const URL_SAFE_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

fn random_from(alphabet: &[u8], len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from(alphabet[rng.random_range(0..alphabet.len())]))
        .collect()
}

/// Random string over the URL-safe alphabet.
#[must_use]
pub fn random_string(len: usize) -> String {
    random_from(URL_SAFE_ALPHABET, len)
}

/// Fresh candidate session code.
#[must_use]
pub fn generate_session_code() -> String {
    random_from(SESSION_CODE_ALPHABET, SESSION_CODE_LEN)
}

/// Fresh refresh token.
#[must_use]
pub fn generate_refresh_token() -> String {
    random_string(REFRESH_TOKEN_LEN)
}

/// Credentials handed out on claim and refresh.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedSession {
    /// Session id.
    pub session: String,
    /// Single-use refresh token.
    pub refresh_token: String,
    /// Session token lifetime in seconds.
    pub expires_in: u64,
    /// Session token.
    pub token: String,
}

/// Session operations over a store backend and a token codec.
pub struct SessionService {
    backend: Arc<dyn SessionBackend>,
    tokens: Arc<SessionTokenCodec>,
    refresh_ttl: Duration,
}

impl SessionService {
    /// Create a service.
    #[must_use]
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        tokens: Arc<SessionTokenCodec>,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            backend,
            tokens,
            refresh_ttl,
        }
    }

    /// Token codec in use.
    #[must_use]
    pub fn tokens(&self) -> &SessionTokenCodec {
        &self.tokens
    }

    /// Pick a candidate id that is not currently held.
    pub async fn allocate_candidate(&self) -> Result<String> {
        self.allocate_with(generate_session_code).await
    }

    /// Like [`Self::allocate_candidate`] with a custom generator.
    pub async fn allocate_with<F>(&self, mut generate: F) -> Result<String>
    where
        F: FnMut() -> String + Send,
    {
        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            let candidate = generate();
            if !self.backend.session_exists(&candidate).await? {
                return Ok(candidate);
            }
            debug!(attempt, "Candidate session id already held");
        }
        warn!(
            attempts = MAX_ALLOCATION_ATTEMPTS,
            "Giving up on candidate allocation"
        );
        Err(Error::OutOfSessionIds(MAX_ALLOCATION_ATTEMPTS))
    }

    /// Claim `session_id` and issue credentials. The proof of work must
    /// already be verified.
    pub async fn claim(&self, session_id: &str) -> Result<IssuedSession> {
        let refresh_token = generate_refresh_token();
        match self
            .backend
            .claim_session(session_id, &refresh_token, self.refresh_ttl)
            .await?
        {
            ClaimOutcome::Claimed => {
                info!(session = %session_id, "Session claimed");
                self.issue(session_id, refresh_token)
            }
            ClaimOutcome::Taken => Err(Error::SessionTaken(session_id.to_string())),
        }
    }

    /// Rotate a refresh token and issue a new session token.
    ///
    /// The session token may be expired but must be authentic.
    pub async fn refresh(&self, session_token: &str, refresh_token: &str) -> Result<IssuedSession> {
        let session_id = self.tokens.verify_for_refresh(session_token)?;
        let next = generate_refresh_token();
        match self
            .backend
            .rotate_refresh_token(&session_id, refresh_token, &next, self.refresh_ttl)
            .await?
        {
            RotateOutcome::Rotated => {
                debug!(session = %session_id, "Refresh token rotated");
                self.issue(&session_id, next)
            }
            RotateOutcome::Mismatch => Err(Error::RefreshMismatch),
            RotateOutcome::Missing => Err(Error::SessionExpired(session_id)),
        }
    }

    /// Verify a session token and return its session id.
    pub fn authenticate(&self, session_token: &str) -> Result<String> {
        Ok(self.tokens.verify(session_token)?)
    }

    /// Store configuration for the session named by `session_token`.
    pub async fn set_config(&self, session_token: &str, config: &SessionConfig) -> Result<String> {
        let session_id = self.authenticate(session_token)?;
        config.validate().map_err(Error::BadRequest)?;
        match self.backend.set_config(&session_id, config).await? {
            ConfigOutcome::Stored => {
                debug!(session = %session_id, interval = config.request_interval, "Session config stored");
                Ok(session_id)
            }
            ConfigOutcome::Missing => Err(Error::SessionExpired(session_id)),
        }
    }

    /// Read configuration for `session_id`.
    pub async fn get_config(&self, session_id: &str) -> Result<SessionConfig> {
        self.backend
            .get_config(session_id)
            .await?
            .ok_or_else(|| Error::ConfigNotFound(session_id.to_string()))
    }

    fn issue(&self, session_id: &str, refresh_token: String) -> Result<IssuedSession> {
        Ok(IssuedSession {
            session: session_id.to_string(),
            refresh_token,
            expires_in: self.tokens.lifetime().as_secs(),
            token: self.tokens.issue(session_id)?,
        })
    }
}
