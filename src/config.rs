//! Configuration management
//!
//! Sources, lowest precedence first:
//!
//! 1. built-in defaults,
//! 2. an optional YAML file,
//! 3. flat legacy variables (`REDIS_URI`, `POW_SECRET`, `PUBSUB_URL`, ...),
//! 4. `SESSION_GATE_*` variables, nested with `__`
//!    (`SESSION_GATE_RELAY__TIMEOUT_SECS=5`).
//!
//! Files listed in `env_files` (default `.env`) are loaded into the process
//! environment before the variables are read.

use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{Error, Result};

/// Environment prefix for nested configuration keys.
pub const ENV_PREFIX: &str = "SESSION_GATE_";

/// Flat environment names kept for existing deployments, and the config
/// path each one feeds.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("REDIS_URI", "store.uri"),
    ("REFRESH_TOKEN_TTL", "store.refresh_token_ttl_secs"),
    ("POW_SECRET", "pow.secret"),
    ("POW_DIFFICULTY", "pow.difficulty"),
    ("JWT_SECRET", "session_token.secret"),
    ("PUBSUB_URL", "relay.url"),
    ("PUBSUB_SECRET", "relay.secret"),
    ("TWITCH_CLIENT_ID", "twitch_oauth.client_id"),
    ("TWITCH_CLIENT_SECRET", "twitch_oauth.client_secret"),
    ("REQUEST_INTERVAL", "rate_limit.default_interval_secs"),
];

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files loaded before variables are read. Missing files are skipped.
    pub env_files: Vec<String>,
    /// HTTP listener
    pub server: ServerConfig,
    /// Session store
    pub store: StoreConfig,
    /// Proof-of-work gate
    pub pow: PowConfig,
    /// Rate limiter
    pub rate_limit: RateLimitConfig,
    /// Session token signing
    pub session_token: SessionTokenConfig,
    /// Pub-sub relay
    pub relay: RelayConfig,
    /// Third-party key sets
    pub identity: IdentityConfig,
    /// Twitch OAuth code exchange
    pub twitch_oauth: TwitchOAuthConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Session store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `redis://`, `rediss://` or `memory://`
    pub uri: String,
    /// Refresh window in seconds; also the lifetime of `session:{id}`
    pub refresh_token_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: "redis://localhost:6379".to_string(),
            refresh_token_ttl_secs: 3600,
        }
    }
}

/// Proof-of-work configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowConfig {
    /// Checksum secret. A random per-process secret is used when unset.
    pub secret: Option<String>,
    /// Required leading zero hex digits. Unparsable values fall back to 0.
    #[serde(deserialize_with = "lenient_difficulty")]
    pub difficulty: u32,
    /// Seconds a challenge stays solvable
    pub freshness_secs: u64,
}

impl Default for PowConfig {
    fn default() -> Self {
        Self {
            secret: None,
            difficulty: 0,
            freshness_secs: 60,
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Window in seconds for sessions that never set `requestInterval`
    pub default_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: 60,
        }
    }
}

/// Session token configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTokenConfig {
    /// HMAC secret. A random per-process secret is used when unset.
    pub secret: Option<String>,
    /// Token lifetime in seconds
    pub lifetime_secs: u64,
}

impl Default for SessionTokenConfig {
    fn default() -> Self {
        Self {
            secret: None,
            lifetime_secs: 3600,
        }
    }
}

/// Pub-sub relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Base URL; required
    pub url: Option<String>,
    /// Sent verbatim in the `authorization` header
    pub secret: Option<String>,
    /// Per-call timeout in seconds
    pub timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: None,
            secret: None,
            timeout_secs: 10,
        }
    }
}

/// Identity key-set endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Google certificate map (kid → PEM)
    pub google_certs_url: String,
    /// Twitch JWKS
    pub twitch_keys_url: String,
    /// Fetch timeout in seconds
    pub fetch_timeout_secs: u64,
    /// Google key-set lifetime when the response carries no cache headers
    pub google_default_max_age_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            google_certs_url: "https://www.googleapis.com/oauth2/v1/certs".to_string(),
            twitch_keys_url: "https://id.twitch.tv/oauth2/keys".to_string(),
            fetch_timeout_secs: 10,
            google_default_max_age_secs: 3600,
        }
    }
}

/// Twitch OAuth code exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwitchOAuthConfig {
    /// Application client id
    pub client_id: Option<String>,
    /// Application client secret
    pub client_secret: Option<String>,
    /// Token endpoint
    pub token_url: String,
    /// Redirect URI registered with the application
    pub redirect_uri: String,
}

impl Default for TwitchOAuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            token_url: "https://id.twitch.tv/oauth2/token".to_string(),
            redirect_uri: "http://localhost:3006/auth/twitch".to_string(),
        }
    }
}

impl TwitchOAuthConfig {
    /// Client credentials, if both are set.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.client_id.as_deref(), self.client_secret.as_deref()) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Some((id, secret)),
            _ => None,
        }
    }
}

fn lenient_difficulty<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    let parsed = match Raw::deserialize(deserializer)? {
        Raw::Number(n) => u32::try_from(n).ok(),
        Raw::Text(s) => s.trim().parse::<u32>().ok(),
    };
    Ok(parsed.unwrap_or_else(|| {
        tracing::warn!("PoW difficulty is not a non-negative integer, using 0");
        0
    }))
}

/// Figment provider for the flat legacy variable names.
fn legacy_env() -> Env {
    Env::raw()
        .only(&LEGACY_ENV.iter().map(|(name, _)| *name).collect::<Vec<_>>())
        .map(|key| {
            LEGACY_ENV
                .iter()
                .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
                .map_or_else(|| key.into(), |(_, path)| (*path).into())
        })
}

impl Config {
    /// Load configuration from an optional file, env files and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut base = Figment::new();
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            base = base.merge(Yaml::file(p));
        }

        let env_files: Vec<String> = base
            .clone()
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract_inner("env_files")
            .unwrap_or_else(|_| vec![".env".to_string()]);
        load_env_files(&env_files);

        let config: Self = base
            .merge(legacy_env())
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the gate cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.relay.url.as_deref().is_none_or(str::is_empty) {
            return Err(Error::Config(
                "relay url is required (PUBSUB_URL or SESSION_GATE_RELAY__URL)".to_string(),
            ));
        }
        if self.pow.difficulty > pow_core::MAX_DIFFICULTY {
            return Err(Error::Config(format!(
                "PoW difficulty {} exceeds the {} hex digits of a SHA-256 hash",
                self.pow.difficulty,
                pow_core::MAX_DIFFICULTY
            )));
        }
        if self.store.refresh_token_ttl_secs == 0 {
            return Err(Error::Config(
                "refresh token ttl must be positive".to_string(),
            ));
        }
        if self.session_token.lifetime_secs == 0 {
            return Err(Error::Config(
                "session token lifetime must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn load_env_files(paths: &[String]) {
    for path in paths {
        let p = Path::new(path);
        if !p.exists() {
            tracing::debug!("Env file not found (skipped): {path}");
            continue;
        }
        match dotenvy::from_path(p) {
            Ok(()) => tracing::info!("Loaded env file: {path}"),
            Err(e) => tracing::warn!("Failed to load env file {path}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn with_relay(mut config: Config) -> Config {
        config.relay.url = Some("http://relay.local".to_string());
        config
    }

    #[test]
    fn defaults_match_deployed_values() {
        let config = Config::default();
        assert_eq!(config.store.uri, "redis://localhost:6379");
        assert_eq!(config.store.refresh_token_ttl_secs, 3600);
        assert_eq!(config.pow.difficulty, 0);
        assert_eq!(config.pow.freshness_secs, 60);
        assert_eq!(config.rate_limit.default_interval_secs, 60);
        assert_eq!(config.session_token.lifetime_secs, 3600);
        assert_eq!(config.relay.timeout_secs, 10);
    }

    #[test]
    fn missing_relay_url_is_fatal() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("relay url"));
        assert!(with_relay(Config::default()).validate().is_ok());
    }

    #[test]
    fn unsolvable_difficulty_is_rejected() {
        let mut config = with_relay(Config::default());
        config.pow.difficulty = 65;
        assert!(config.validate().is_err());
    }

    #[test]
    fn legacy_env_names_are_honoured() {
        Jail::expect_with(|jail| {
            // GIVEN: a deployment configured with the flat variable names
            jail.set_env("REDIS_URI", "redis://cache:6379");
            jail.set_env("POW_DIFFICULTY", "3");
            jail.set_env("PUBSUB_URL", "http://relay:80");
            jail.set_env("REFRESH_TOKEN_TTL", "7200");

            // WHEN
            let config = Config::load(None).map_err(|e| e.to_string())?;

            // THEN
            assert_eq!(config.store.uri, "redis://cache:6379");
            assert_eq!(config.pow.difficulty, 3);
            assert_eq!(config.relay.url.as_deref(), Some("http://relay:80"));
            assert_eq!(config.store.refresh_token_ttl_secs, 7200);
            Ok(())
        });
    }

    #[test]
    fn prefixed_env_overrides_legacy() {
        Jail::expect_with(|jail| {
            jail.set_env("PUBSUB_URL", "http://old:80");
            jail.set_env("SESSION_GATE_RELAY__URL", "http://new:80");
            let config = Config::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.relay.url.as_deref(), Some("http://new:80"));
            Ok(())
        });
    }

    #[test]
    fn garbled_difficulty_falls_back_to_zero() {
        Jail::expect_with(|jail| {
            jail.set_env("PUBSUB_URL", "http://relay:80");
            jail.set_env("POW_DIFFICULTY", "hard");
            let config = Config::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.pow.difficulty, 0);
            Ok(())
        });
    }

    #[test]
    fn yaml_file_is_merged() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "gate.yaml",
                "relay:\n  url: http://relay:80\npow:\n  difficulty: 2\nserver:\n  port: 9000\n",
            )?;
            let config = Config::load(Some(Path::new("gate.yaml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.server.port, 9000);
            assert_eq!(config.pow.difficulty, 2);
            Ok(())
        });
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let result = Config::load(Some(Path::new("/nonexistent/gate.yaml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn twitch_credentials_need_both_halves() {
        let mut oauth = TwitchOAuthConfig::default();
        assert!(oauth.credentials().is_none());
        oauth.client_id = Some("id".to_string());
        assert!(oauth.credentials().is_none());
        oauth.client_secret = Some("secret".to_string());
        assert_eq!(oauth.credentials(), Some(("id", "secret")));
    }
}
