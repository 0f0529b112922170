//! Pub-sub relay client.
//!
//! The relay is an nginx push-stream style server: `POST /pub?id={channel}`
//! publishes, `GET /channels-stats?id={channel}` answers 404 when nobody
//! listens. Payloads are opaque bytes.

use std::future::Future;
use std::time::Duration;

use axum::body::Bytes;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::config::RelayConfig;
use crate::{Error, Result};

/// Channel a session's host listens on for listener requests.
#[must_use]
pub fn host_channel(session_id: &str) -> String {
    format!("host_{session_id}")
}

/// Client for the relay's publish and channel-stats endpoints.
#[derive(Clone)]
pub struct RelayClient {
    http: Client,
    base_url: String,
    secret: Option<String>,
    timeout: Duration,
}

impl RelayClient {
    /// Build a client. The relay URL is required.
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let base_url = config
            .url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Config("relay url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();
        let http = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create relay HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            secret: config.secret.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// Publish `payload` to `channel` and return the relay's answer body.
    pub async fn publish(&self, channel: &str, payload: Bytes) -> Result<Bytes> {
        let mut request = self
            .http
            .post(format!("{}/pub", self.base_url))
            .query(&[("id", channel)])
            .body(payload);
        if let Some(secret) = &self.secret {
            request = request.header("authorization", secret);
        }

        let response = self.bounded(request.send()).await?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            warn!(channel = %channel, status = status.as_u16(), "Relay rejected publish");
            return Err(Error::RelayStatus(status.as_u16()));
        }
        debug!(channel = %channel, "Published to relay");
        self.bounded(response.bytes()).await
    }

    /// Whether `channel` has at least one subscriber.
    pub async fn is_active(&self, channel: &str) -> Result<bool> {
        let request = self
            .http
            .get(format!("{}/channels-stats", self.base_url))
            .query(&[("id", channel)]);

        let response = self.bounded(request.send()).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => {
                warn!(channel = %channel, status = s.as_u16(), "Relay channel stats failed");
                Err(Error::RelayStatus(s.as_u16()))
            }
        }
    }

    async fn bounded<F, T>(&self, call: F) -> Result<T>
    where
        F: Future<Output = reqwest::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!(timeout = ?self.timeout, "Relay call timed out");
                Err(Error::RelayTimeout(self.timeout))
            }
        }
    }
}
