//! Session tokens: short-lived HS256 JWTs naming a claimed session.

use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::SessionTokenConfig;
use crate::session::random_string;
use crate::{Error, Result};

/// Why a presented session token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenRejection {
    /// Authentic but past `exp`.
    #[error("session token expired")]
    Expired,
    /// Signature does not verify under the server secret.
    #[error("session token signature invalid")]
    InvalidSignature,
    /// Not a decodable HS256 JWT with the expected claims.
    #[error("session token malformed")]
    Malformed,
}

impl TokenRejection {
    /// Machine-readable reason.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Expired => "token_expired",
            Self::InvalidSignature => "token_invalid",
            Self::Malformed => "token_malformed",
        }
    }
}

impl From<jsonwebtoken::errors::Error> for TokenRejection {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            _ => Self::Malformed,
        }
    }
}

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Claimed session id.
    pub session: String,
    /// Expiry, unix seconds.
    pub exp: i64,
}

/// Signs and verifies session tokens.
pub struct SessionTokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    lifetime: Duration,
}

impl SessionTokenCodec {
    /// Build a codec from configuration. Without a secret a random one is
    /// used and tokens do not survive a restart.
    #[must_use]
    pub fn new(config: &SessionTokenConfig) -> Self {
        let secret = match config.secret.as_deref() {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => {
                warn!("Session token secret not configured, using a random per-process secret");
                random_string(64)
            }
        };
        Self::with_secret(&secret, Duration::from_secs(config.lifetime_secs))
    }

    /// Build a codec with an explicit secret.
    #[must_use]
    pub fn with_secret(secret: &str, lifetime: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            lifetime,
        }
    }

    /// Token lifetime.
    #[must_use]
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Issue a token for `session_id` valid from now.
    pub fn issue(&self, session_id: &str) -> Result<String> {
        self.issue_at(session_id, chrono::Utc::now().timestamp())
    }

    /// Issue a token as if the current unix time were `now`.
    pub fn issue_at(&self, session_id: &str, now: i64) -> Result<String> {
        let lifetime = i64::try_from(self.lifetime.as_secs()).unwrap_or(i64::MAX);
        let claims = SessionClaims {
            session: session_id.to_string(),
            exp: now.saturating_add(lifetime),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("failed to sign session token: {e}")))
    }

    /// Verify a token and return its session id.
    pub fn verify(&self, token: &str) -> std::result::Result<String, TokenRejection> {
        self.decode(token, true)
    }

    /// Verify a token's signature but accept it past `exp`. Only the refresh
    /// flow uses this, since recovering from expiry is its purpose.
    pub fn verify_for_refresh(&self, token: &str) -> std::result::Result<String, TokenRejection> {
        self.decode(token, false)
    }

    fn decode(&self, token: &str, check_exp: bool) -> std::result::Result<String, TokenRejection> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = check_exp;
        let data = decode::<SessionClaims>(token, &self.decoding, &validation)?;
        if data.claims.session.is_empty() {
            return Err(TokenRejection::Malformed);
        }
        Ok(data.claims.session)
    }
}
