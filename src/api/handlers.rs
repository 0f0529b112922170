//! Request handlers

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{AppState, SESSION_TOKEN_HEADER};
use crate::identity::Provider;
use crate::pow::{Challenge, Submission};
use crate::relay::host_channel;
use crate::session::IssuedSession;
use crate::store::SessionConfig;
use crate::{Error, Result};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn session_token(headers: &HeaderMap) -> Result<&str> {
    headers
        .get(SESSION_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::BadRequest("missing X-Session-Token header".to_string()))
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /session/issue
pub async fn issue(State(state): State<Arc<AppState>>) -> Result<Json<Challenge>> {
    let candidate = state.sessions.allocate_candidate().await?;
    let challenge = state.pow.issue(&candidate, now());
    debug!(session = %candidate, difficulty = challenge.difficulty, "Challenge issued");
    Ok(Json(challenge))
}

/// POST /session/claim
pub async fn claim(
    State(state): State<Arc<AppState>>,
    Json(submission): Json<Submission>,
) -> Result<Json<IssuedSession>> {
    state.pow.verify(&submission, now())?;
    let issued = state.sessions.claim(&submission.session_id).await?;
    Ok(Json(issued))
}

/// Query of POST /session/refresh
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshQuery {
    session_token: Option<String>,
    refresh_token: Option<String>,
}

/// POST /session/refresh
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RefreshQuery>,
) -> Result<Json<IssuedSession>> {
    let session_token = query
        .session_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::BadRequest("missing query: sessionToken".to_string()))?;
    let refresh_token = query
        .refresh_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::BadRequest("missing query: refreshToken".to_string()))?;
    let issued = state.sessions.refresh(&session_token, &refresh_token).await?;
    Ok(Json(issued))
}

/// POST /session/update
///
/// The body goes verbatim to the session's listener channel.
pub async fn update(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let session_id = state.sessions.authenticate(session_token(&headers)?)?;
    let answer = state.relay.publish(&session_id, body).await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], answer))
}

/// Body of POST /session/request
#[derive(Debug, Deserialize)]
pub struct ListenerRequest {
    /// Target session
    pub session: String,
    /// `google` or `twitch`
    pub provider: String,
    /// Provider ID token
    pub token: String,
    /// Opaque request for the host
    pub request: String,
}

/// POST /session/request
///
/// Identity first, then the rate limit, then the active check. A call that is
/// admitted but cannot be delivered is given back to the caller's quota.
pub async fn request(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ListenerRequest>,
) -> Result<StatusCode> {
    let provider: Provider = req.provider.parse()?;
    let subject = state.identity.validate(provider, &req.token).await?;
    state.rate_limiter.admit(&req.session, &subject).await?;

    match forward(&state, &req.session, Bytes::from(req.request)).await {
        Ok(()) => Ok(StatusCode::OK),
        Err(e) => {
            if matches!(e, Error::InactiveSession(_)) || e.is_transient() {
                if let Err(reverse_err) = state.rate_limiter.reverse(&req.session, &subject).await {
                    warn!(session = %req.session, error = %reverse_err, "Rate limit reversal failed");
                }
            }
            Err(e)
        }
    }
}

async fn forward(state: &Arc<AppState>, session_id: &str, payload: Bytes) -> Result<()> {
    if !state.relay.is_active(session_id).await? {
        return Err(Error::InactiveSession(session_id.to_string()));
    }

    let relay = state.relay.clone();
    let channel = host_channel(session_id);
    let publish = tokio::spawn(async move { relay.publish(&channel, payload).await });
    publish
        .await
        .map_err(|e| Error::Internal(format!("relay publish task failed: {e}")))??;
    Ok(())
}

/// Query of GET /session/config
#[derive(Debug, Deserialize)]
pub struct ConfigQuery {
    session: Option<String>,
}

/// GET /session/config
pub async fn get_config(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConfigQuery>,
) -> Result<Json<SessionConfig>> {
    let session_id = query
        .session
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::BadRequest("no session query".to_string()))?;
    Ok(Json(state.sessions.get_config(&session_id).await?))
}

/// POST /session/config
pub async fn set_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(config): Json<SessionConfig>,
) -> Result<Json<SessionConfig>> {
    let session_id = state
        .sessions
        .set_config(session_token(&headers)?, &config)
        .await?;
    info!(session = %session_id, interval = config.request_interval, "Session config updated");
    Ok(Json(config))
}

/// Query of POST /auth/twitch
#[derive(Debug, Deserialize)]
pub struct TwitchAuthQuery {
    code: Option<String>,
}

/// POST /auth/twitch
pub async fn twitch_auth(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TwitchAuthQuery>,
) -> Result<impl IntoResponse> {
    let oauth = state
        .twitch
        .as_ref()
        .ok_or(Error::NotConfigured("twitch oauth"))?;
    let answer = oauth.exchange(query.code.as_deref().unwrap_or("")).await?;
    let status = StatusCode::from_u16(answer.status).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((
        status,
        [(header::CONTENT_TYPE, "application/json")],
        answer.body,
    ))
}
