//! Key-set sources: Google's PEM map, Twitch's JWKS, and a static set.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use reqwest::Client;
use reqwest::header::{CACHE_CONTROL, EXPIRES, HeaderMap};
use tracing::{debug, warn};
use x509_parser::pem::parse_x509_pem;
use x509_parser::public_key::PublicKey;

use super::keyset::{FetchedKeys, KeySetSource};
use super::{IdentityError, Provider};

/// Google's certificate endpoint: a JSON object mapping `kid` to PEM.
pub struct GooglePemSource {
    http: Client,
    url: String,
    default_max_age: Duration,
}

impl GooglePemSource {
    /// Source for `url`. `default_max_age` applies when the response has no
    /// usable cache headers.
    #[must_use]
    pub fn new(http: Client, url: String, default_max_age: Duration) -> Self {
        Self {
            http,
            url,
            default_max_age,
        }
    }
}

#[async_trait]
impl KeySetSource for GooglePemSource {
    async fn fetch(&self) -> Result<FetchedKeys, IdentityError> {
        let response = self.http.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IdentityError::Status {
                provider: Provider::Google,
                status: status.as_u16(),
            });
        }
        let max_age = cache_lifetime(response.headers(), chrono::Utc::now())
            .unwrap_or(self.default_max_age);
        let body = response.text().await?;
        let mut fetched = parse_google_certs(&body)?;
        fetched.max_age = Some(max_age);
        debug!(keys = fetched.keys.len(), max_age = ?max_age, "Fetched Google certificates");
        Ok(fetched)
    }
}

/// Twitch's JWKS endpoint. The set is cached until restart.
pub struct TwitchJwksSource {
    http: Client,
    url: String,
}

impl TwitchJwksSource {
    /// Source for `url`.
    #[must_use]
    pub fn new(http: Client, url: String) -> Self {
        Self { http, url }
    }
}

#[async_trait]
impl KeySetSource for TwitchJwksSource {
    async fn fetch(&self) -> Result<FetchedKeys, IdentityError> {
        let response = self.http.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IdentityError::Status {
                provider: Provider::Twitch,
                status: status.as_u16(),
            });
        }
        let body = response.text().await?;
        let fetched = parse_jwks(&body)?;
        debug!(keys = fetched.keys.len(), "Fetched Twitch JWKS");
        Ok(fetched)
    }
}

/// A fixed key set, for tests and offline runs.
pub struct StaticKeySource {
    keys: FetchedKeys,
}

impl StaticKeySource {
    /// Source that always returns `keys`.
    #[must_use]
    pub fn new(keys: FetchedKeys) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl KeySetSource for StaticKeySource {
    async fn fetch(&self) -> Result<FetchedKeys, IdentityError> {
        Ok(self.keys.clone())
    }
}

/// Parse a `{kid: pem}` map. Entries that fail to parse are skipped with a
/// warning; an unparsable document is an error.
pub fn parse_google_certs(body: &str) -> Result<FetchedKeys, IdentityError> {
    let map: HashMap<String, String> =
        serde_json::from_str(body).map_err(|e| IdentityError::Parse(e.to_string()))?;
    let mut keys = HashMap::with_capacity(map.len());
    for (kid, pem) in map {
        match decoding_key_from_pem(&pem) {
            Ok(key) => {
                keys.insert(kid, key);
            }
            Err(e) => warn!(kid = %kid, error = %e, "Skipping unusable Google key"),
        }
    }
    Ok(FetchedKeys {
        keys,
        max_age: None,
    })
}

/// Parse a JWKS document, keeping RSA keys that carry a `kid`.
pub fn parse_jwks(body: &str) -> Result<FetchedKeys, IdentityError> {
    let set: JwkSet = serde_json::from_str(body).map_err(|e| IdentityError::Parse(e.to_string()))?;
    let mut keys = HashMap::new();
    for jwk in &set.keys {
        let Some(kid) = jwk.common.key_id.as_deref() else {
            continue;
        };
        if let AlgorithmParameters::RSA(rsa) = &jwk.algorithm {
            match DecodingKey::from_rsa_components(&rsa.n, &rsa.e) {
                Ok(key) => {
                    keys.insert(kid.to_string(), key);
                }
                Err(e) => warn!(kid = %kid, error = %e, "Skipping unusable JWK"),
            }
        }
    }
    Ok(FetchedKeys {
        keys,
        max_age: None,
    })
}

/// Decoding key from an X.509 certificate or an RSA public key PEM.
fn decoding_key_from_pem(pem: &str) -> Result<DecodingKey, IdentityError> {
    if !pem.contains("BEGIN CERTIFICATE") {
        return DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| IdentityError::Parse(e.to_string()));
    }

    let (_, block) =
        parse_x509_pem(pem.as_bytes()).map_err(|e| IdentityError::Parse(e.to_string()))?;
    let cert = block
        .parse_x509()
        .map_err(|e| IdentityError::Parse(e.to_string()))?;
    match cert.public_key().parsed() {
        Ok(PublicKey::RSA(rsa)) => Ok(DecodingKey::from_rsa_raw_components(
            strip_leading_zeros(rsa.modulus),
            strip_leading_zeros(rsa.exponent),
        )),
        Ok(_) => Err(IdentityError::Parse(
            "certificate key is not RSA".to_string(),
        )),
        Err(e) => Err(IdentityError::Parse(e.to_string())),
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// Cache lifetime from `Cache-Control: max-age`, else `Expires`.
fn cache_lifetime(headers: &HeaderMap, now: chrono::DateTime<chrono::Utc>) -> Option<Duration> {
    let from_max_age = headers
        .get(CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.split(',').find_map(|directive| {
                directive
                    .trim()
                    .strip_prefix("max-age=")
                    .and_then(|secs| secs.trim().parse::<u64>().ok())
            })
        })
        .map(Duration::from_secs);
    if from_max_age.is_some() {
        return from_max_age;
    }

    let expires = headers.get(EXPIRES)?.to_str().ok()?;
    let at = chrono::DateTime::parse_from_rfc2822(expires).ok()?;
    (at.with_timezone(&chrono::Utc) - now).to_std().ok()
}
