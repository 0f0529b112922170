//! Twitch OAuth authorization-code exchange.
//!
//! Keeps the client secret server-side: the browser hands over the code, the
//! gate trades it at Twitch's token endpoint and passes the answer back.

use std::time::Duration;

use axum::body::Bytes;
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::TwitchOAuthConfig;
use crate::{Error, Result};

/// Token endpoint answer, passed through untouched.
#[derive(Debug, Clone)]
pub struct TokenExchange {
    /// Upstream HTTP status
    pub status: u16,
    /// Upstream JSON body
    pub body: Bytes,
}

/// Client for the code exchange.
pub struct TwitchOAuth {
    http: Client,
    token_url: String,
    redirect_uri: String,
    client_id: String,
    client_secret: String,
}

impl TwitchOAuth {
    /// Build from configuration; `None` when the client credentials are unset.
    pub fn from_config(config: &TwitchOAuthConfig) -> Result<Option<Self>> {
        let Some((client_id, client_secret)) = config.credentials() else {
            warn!("Twitch client credentials missing, /auth/twitch is disabled");
            return Ok(None);
        };
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create Twitch HTTP client: {e}")))?;
        Ok(Some(Self {
            http,
            token_url: config.token_url.clone(),
            redirect_uri: config.redirect_uri.clone(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        }))
    }

    /// Trade an authorization code for tokens.
    pub async fn exchange(&self, code: &str) -> Result<TokenExchange> {
        if code.is_empty() {
            return Err(Error::BadRequest("missing code".to_string()));
        }
        let response = self
            .http
            .post(&self.token_url)
            .query(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        debug!(status, "Twitch code exchange answered");
        Ok(TokenExchange { status, body })
    }
}
