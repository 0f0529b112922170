//! HTTP surface
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness |
//! | `GET` | `/session/issue` | Allocate a candidate id and issue a PoW challenge |
//! | `POST` | `/session/claim` | Verify the solution and claim the session |
//! | `POST` | `/session/refresh` | Rotate the refresh token |
//! | `POST` | `/session/update` | Host publishes to its listeners |
//! | `POST` | `/session/request` | Listener sends a request to the host |
//! | `GET` | `/session/config` | Read a session's config |
//! | `POST` | `/session/config` | Host writes its config |
//! | `POST` | `/auth/twitch` | Twitch authorization-code exchange |

mod handlers;
mod server;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    http::{HeaderName, HeaderValue, Method, Request, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{Span, debug, debug_span, error, warn};

pub use server::Gate;

use crate::config::Config;
use crate::identity::IdentityValidator;
use crate::pow::PowGate;
use crate::rate_limit::RateLimiter;
use crate::relay::RelayClient;
use crate::session::SessionService;
use crate::store::{self, SessionBackend};
use crate::token::SessionTokenCodec;
use crate::twitch::TwitchOAuth;
use crate::{Error, Result};

/// Header carrying the host's session token.
pub const SESSION_TOKEN_HEADER: &str = "x-session-token";

/// Shared application state
pub struct AppState {
    /// Proof-of-work gate
    pub pow: PowGate,
    /// Session lifecycle
    pub sessions: SessionService,
    /// Per-identity limiter
    pub rate_limiter: RateLimiter,
    /// Bearer token validation
    pub identity: Arc<IdentityValidator>,
    /// Pub-sub relay
    pub relay: RelayClient,
    /// Twitch code exchange, when configured
    pub twitch: Option<TwitchOAuth>,
}

impl AppState {
    /// Wire every component from configuration, connecting to the store.
    pub async fn from_config(config: &Config) -> Result<Arc<Self>> {
        let backend = store::connect(&config.store.uri).await?;
        let identity = Arc::new(IdentityValidator::new(&config.identity)?);
        Self::with_parts(config, backend, identity)
    }

    /// Wire components over an existing backend and validator.
    pub fn with_parts(
        config: &Config,
        backend: Arc<dyn SessionBackend>,
        identity: Arc<IdentityValidator>,
    ) -> Result<Arc<Self>> {
        let tokens = Arc::new(SessionTokenCodec::new(&config.session_token));
        Ok(Arc::new(Self {
            pow: PowGate::new(&config.pow),
            sessions: SessionService::new(
                Arc::clone(&backend),
                tokens,
                Duration::from_secs(config.store.refresh_token_ttl_secs),
            ),
            rate_limiter: RateLimiter::new(
                backend,
                Duration::from_secs(config.rate_limit.default_interval_secs),
            ),
            identity,
            relay: RelayClient::new(&config.relay)?,
            twitch: TwitchOAuth::from_config(&config.twitch_oauth)?,
        }))
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/session/issue", get(handlers::issue))
        .route("/session/claim", post(handlers::claim))
        .route("/session/refresh", post(handlers::refresh))
        .route("/session/update", post(handlers::update))
        .route("/session/request", post(handlers::request))
        .route(
            "/session/config",
            get(handlers::get_config).post(handlers::set_config),
        )
        .route("/auth/twitch", post(handlers::twitch_auth))
        .layer(cors_layer())
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(state)
}

/// Request span with the path only. Query strings carry session and refresh tokens.
fn request_span(request: &Request<Body>) -> Span {
    debug_span!(
        "request",
        method = %request.method(),
        path = request.uri().path(),
        version = ?request.version(),
    )
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            HeaderName::from_static(SESSION_TOKEN_HEADER),
            header::CONTENT_TYPE,
        ])
        .expose_headers([header::RETRY_AFTER])
        .max_age(Duration::from_secs(7200))
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            if self.is_transient() {
                warn!(error = %self, status = status.as_u16(), "Dependency failure");
            } else {
                error!(error = %self, status = status.as_u16(), "Request failed");
            }
        } else {
            debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let retry_after = match &self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        };
        let mut response = (
            status,
            Json(json!({"error": self.code(), "message": self.to_string()})),
        )
            .into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
