//! Third-party bearer token validation (Google, Twitch).
//!
//! # Flow
//!
//! 1. Decode the JWT header without verification to read `kid`.
//! 2. Look the key up in the provider's cached key set (fetched on first use
//!    and whenever the Google set's cache lifetime has passed).
//! 3. Verify the RS256 signature and `exp` (60 s leeway). Audience is not checked.
//! 4. Check the issuer: Google `accounts.google.com` (with or without
//!    `https://`), Twitch anything containing `id.twitch.tv`.
//! 5. Return the `sub` claim, which becomes the rate-limit identity.
//!
//! An unknown `kid` does not trigger a refetch.

mod keyset;
mod sources;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation, decode, decode_header};
use serde::Deserialize;
use tracing::{debug, warn};

pub use keyset::{FetchedKeys, KeySetCache, KeySetSource, KeySnapshot};
pub use sources::{GooglePemSource, StaticKeySource, TwitchJwksSource, parse_google_certs, parse_jwks};

use crate::config::IdentityConfig;
use crate::{Error, Result};

/// Identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    /// Google ID tokens
    Google,
    /// Twitch ID tokens
    Twitch,
}

impl Provider {
    /// Lowercase name used on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Twitch => "twitch",
        }
    }

    fn issuer_ok(self, iss: &str) -> bool {
        match self {
            Self::Google => iss == "accounts.google.com" || iss == "https://accounts.google.com",
            Self::Twitch => iss.contains("id.twitch.tv"),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Ok(Self::Google),
            "twitch" => Ok(Self::Twitch),
            other => Err(Error::BadRequest(format!("unknown identity provider: {other}"))),
        }
    }
}

/// Why a bearer token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IdentityRejection {
    /// Header or claims cannot be decoded, or `kid` is missing.
    #[error("malformed token")]
    MalformedToken,
    /// `kid` is not in the provider's key set.
    #[error("unknown key id")]
    UnknownKeyId,
    /// Issuer does not belong to the provider.
    #[error("bad issuer")]
    BadIssuer,
    /// Signature does not verify.
    #[error("signature invalid")]
    SignatureInvalid,
    /// Past `exp`.
    #[error("token expired")]
    Expired,
}

impl IdentityRejection {
    /// Machine-readable reason.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::MalformedToken => "malformed_token",
            Self::UnknownKeyId => "unknown_key_id",
            Self::BadIssuer => "bad_issuer",
            Self::SignatureInvalid => "signature_invalid",
            Self::Expired => "expired",
        }
    }
}

/// Key-set retrieval failures. Transient from the caller's view.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// Network failure
    #[error("key set fetch failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status from the key endpoint
    #[error("{provider} key endpoint returned {status}")]
    Status {
        /// Provider whose endpoint failed
        provider: Provider,
        /// HTTP status
        status: u16,
    },

    /// Body could not be turned into keys
    #[error("key set unparsable: {0}")]
    Parse(String),
}

#[derive(Debug, Deserialize)]
struct BearerClaims {
    iss: String,
    sub: String,
}

/// Validates provider ID tokens against cached key sets.
pub struct IdentityValidator {
    google: KeySetCache,
    twitch: KeySetCache,
}

impl IdentityValidator {
    /// Build a validator fetching from the configured endpoints.
    pub fn new(config: &IdentityConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create key set HTTP client: {e}")))?;
        Ok(Self::with_sources(
            Arc::new(GooglePemSource::new(
                http.clone(),
                config.google_certs_url.clone(),
                Duration::from_secs(config.google_default_max_age_secs),
            )),
            Arc::new(TwitchJwksSource::new(http, config.twitch_keys_url.clone())),
        ))
    }

    /// Build a validator over explicit key sources.
    #[must_use]
    pub fn with_sources(google: Arc<dyn KeySetSource>, twitch: Arc<dyn KeySetSource>) -> Self {
        Self {
            google: KeySetCache::new(Provider::Google, google),
            twitch: KeySetCache::new(Provider::Twitch, twitch),
        }
    }

    /// Cache for `provider`.
    #[must_use]
    pub fn cache(&self, provider: Provider) -> &KeySetCache {
        match provider {
            Provider::Google => &self.google,
            Provider::Twitch => &self.twitch,
        }
    }

    /// Fetch both key sets in the background.
    pub fn warm_up(self: &Arc<Self>) {
        for provider in [Provider::Google, Provider::Twitch] {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                match this.cache(provider).refresh().await {
                    Ok(snapshot) => debug!(
                        provider = %provider,
                        keys = snapshot.len(),
                        "Key set warmed up"
                    ),
                    Err(e) => warn!(provider = %provider, error = %e, "Key set warm-up failed"),
                }
            });
        }
    }

    /// Validate `token` and return its subject.
    ///
    /// # Errors
    ///
    /// [`Error::Identity`] for a rejected token, [`Error::KeySet`] when the
    /// key set cannot be fetched.
    pub async fn validate(&self, provider: Provider, token: &str) -> Result<String> {
        let header = decode_header(token).map_err(|_| IdentityRejection::MalformedToken)?;
        let kid = header.kid.ok_or(IdentityRejection::MalformedToken)?;

        let snapshot = self.cache(provider).get().await?;
        let key = snapshot.key(&kid).ok_or_else(|| {
            debug!(provider = %provider, kid = %kid, "Unknown key id");
            IdentityRejection::UnknownKeyId
        })?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;
        validation.leeway = 60;
        let data = decode::<BearerClaims>(token, key, &validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => IdentityRejection::Expired,
            ErrorKind::InvalidSignature => IdentityRejection::SignatureInvalid,
            _ => IdentityRejection::MalformedToken,
        })?;

        if !provider.issuer_ok(&data.claims.iss) {
            debug!(provider = %provider, iss = %data.claims.iss, "Issuer rejected");
            return Err(IdentityRejection::BadIssuer.into());
        }
        if data.claims.sub.is_empty() {
            return Err(IdentityRejection::MalformedToken.into());
        }
        Ok(data.claims.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    const SIGNER_KEY: &str = include_str!("../../tests/fixtures/signer_key.pem");
    const SIGNER_CERT: &str = include_str!("../../tests/fixtures/signer_cert.pem");
    const SIGNER_JWKS: &str = include_str!("../../tests/fixtures/signer_jwks.json");

    fn sign(kid: Option<&str>, iss: &str, exp_offset: i64) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = kid.map(str::to_string);
        let now = chrono::Utc::now().timestamp();
        let claims = json!({ "iss": iss, "sub": "user-42", "exp": now + exp_offset });
        let key = EncodingKey::from_rsa_pem(SIGNER_KEY.as_bytes()).unwrap();
        encode(&header, &claims, &key).unwrap()
    }

    fn validator() -> IdentityValidator {
        let certs = json!({ "test-kid": SIGNER_CERT }).to_string();
        IdentityValidator::with_sources(
            Arc::new(StaticKeySource::new(parse_google_certs(&certs).unwrap())),
            Arc::new(StaticKeySource::new(parse_jwks(SIGNER_JWKS).unwrap())),
        )
    }

    #[test]
    fn provider_parses_case_insensitively() {
        assert_eq!("Google".parse::<Provider>().unwrap(), Provider::Google);
        assert_eq!("twitch".parse::<Provider>().unwrap(), Provider::Twitch);
        assert!("github".parse::<Provider>().is_err());
    }

    #[tokio::test]
    async fn google_token_yields_subject() {
        // GIVEN: a token signed by the certificate's key with Google's issuer
        let token = sign(Some("test-kid"), "https://accounts.google.com", 600);

        // WHEN
        let sub = validator().validate(Provider::Google, &token).await.unwrap();

        // THEN
        assert_eq!(sub, "user-42");
    }

    #[tokio::test]
    async fn twitch_token_yields_subject() {
        let token = sign(Some("test-kid"), "https://id.twitch.tv/oauth2", 600);
        let sub = validator().validate(Provider::Twitch, &token).await.unwrap();
        assert_eq!(sub, "user-42");
    }

    async fn rejection(provider: Provider, token: &str) -> IdentityRejection {
        match validator().validate(provider, token).await {
            Err(Error::Identity(r)) => r,
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_kid_is_malformed() {
        let token = sign(None, "accounts.google.com", 600);
        assert_eq!(
            rejection(Provider::Google, &token).await,
            IdentityRejection::MalformedToken
        );
        assert_eq!(
            rejection(Provider::Google, "garbage").await,
            IdentityRejection::MalformedToken
        );
    }

    #[tokio::test]
    async fn unknown_kid_is_rejected() {
        let token = sign(Some("rotated-away"), "accounts.google.com", 600);
        assert_eq!(
            rejection(Provider::Google, &token).await,
            IdentityRejection::UnknownKeyId
        );
    }

    #[tokio::test]
    async fn foreign_issuer_is_rejected() {
        // GIVEN: a Google-signed token presented as Twitch and vice versa
        let google = sign(Some("test-kid"), "accounts.google.com", 600);
        let twitch = sign(Some("test-kid"), "https://id.twitch.tv/oauth2", 600);

        // THEN
        assert_eq!(
            rejection(Provider::Twitch, &google).await,
            IdentityRejection::BadIssuer
        );
        assert_eq!(
            rejection(Provider::Google, &twitch).await,
            IdentityRejection::BadIssuer
        );
    }

    #[tokio::test]
    async fn tampered_payload_fails_signature() {
        let token = sign(Some("test-kid"), "accounts.google.com", 600);
        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        let other = sign(Some("test-kid"), "accounts.google.com", 1200);
        parts[1] = other.split('.').nth(1).unwrap().to_string();
        assert_eq!(
            rejection(Provider::Google, &parts.join(".")).await,
            IdentityRejection::SignatureInvalid
        );
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let token = sign(Some("test-kid"), "accounts.google.com", -3600);
        assert_eq!(
            rejection(Provider::Google, &token).await,
            IdentityRejection::Expired
        );
    }

    #[test]
    fn rejection_codes() {
        assert_eq!(IdentityRejection::MalformedToken.code(), "malformed_token");
        assert_eq!(IdentityRejection::UnknownKeyId.code(), "unknown_key_id");
        assert_eq!(IdentityRejection::BadIssuer.code(), "bad_issuer");
        assert_eq!(IdentityRejection::SignatureInvalid.code(), "signature_invalid");
    }
}
