//! End-to-end session flow tests
//!
//! Drives the router in-process with an in-memory store, static key sets and
//! a local stand-in for the pub-sub relay.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes, to_bytes};
use axum::extract::{Query, State};
use axum::http::{Request, StatusCode, header};
use axum::routing::{get, post};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;

use session_gate::api::{AppState, create_router};
use session_gate::config::Config;
use session_gate::identity::{IdentityValidator, StaticKeySource, parse_google_certs, parse_jwks};
use session_gate::store::MemoryBackend;

const SIGNER_KEY: &str = include_str!("fixtures/signer_key.pem");
const SIGNER_CERT: &str = include_str!("fixtures/signer_cert.pem");
const SIGNER_JWKS: &str = include_str!("fixtures/signer_jwks.json");

#[derive(Clone, Default)]
struct FakeRelay {
    active: Arc<Mutex<HashSet<String>>>,
    published: Arc<Mutex<Vec<(String, String)>>>,
}

impl FakeRelay {
    async fn start(&self) -> String {
        let app = Router::new()
            .route(
                "/pub",
                post(
                    |State(relay): State<FakeRelay>,
                     Query(q): Query<HashMap<String, String>>,
                     body: Bytes| async move {
                        relay.published.lock().push((
                            q.get("id").cloned().unwrap_or_default(),
                            String::from_utf8_lossy(&body).into_owned(),
                        ));
                        (StatusCode::OK, r#"{"channel":"ok"}"#)
                    },
                ),
            )
            .route(
                "/channels-stats",
                get(
                    |State(relay): State<FakeRelay>,
                     Query(q): Query<HashMap<String, String>>| async move {
                        let id = q.get("id").cloned().unwrap_or_default();
                        if relay.active.lock().contains(&id) {
                            StatusCode::OK
                        } else {
                            StatusCode::NOT_FOUND
                        }
                    },
                ),
            )
            .with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn published_to(&self, channel: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

struct Harness {
    app: Router,
    backend: Arc<MemoryBackend>,
    relay: FakeRelay,
}

async fn harness() -> Harness {
    let relay = FakeRelay::default();
    let url = relay.start().await;

    let mut config = Config::default();
    config.relay.url = Some(url);
    config.relay.secret = Some("relay-secret".to_string());
    config.pow.secret = Some("pow-secret".to_string());
    config.pow.difficulty = 1;
    config.session_token.secret = Some("jwt-secret".to_string());

    let certs = json!({ "test-kid": SIGNER_CERT }).to_string();
    let identity = Arc::new(IdentityValidator::with_sources(
        Arc::new(StaticKeySource::new(parse_google_certs(&certs).unwrap())),
        Arc::new(StaticKeySource::new(parse_jwks(SIGNER_JWKS).unwrap())),
    ));

    let backend = Arc::new(MemoryBackend::new());
    let state = AppState::with_parts(&config, backend.clone(), identity).unwrap();
    Harness {
        app: create_router(state),
        backend,
        relay,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, body)
}

fn get_req(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn google_token(sub: &str) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some("test-kid".to_string());
    let claims = json!({
        "iss": "https://accounts.google.com",
        "sub": sub,
        "exp": chrono::Utc::now().timestamp() + 600,
    });
    encode(
        &header,
        &claims,
        &EncodingKey::from_rsa_pem(SIGNER_KEY.as_bytes()).unwrap(),
    )
    .unwrap()
}

/// Issue a challenge, solve it, and build the claim body.
async fn solved_claim(app: &Router) -> Value {
    let (status, _, challenge) = send(app, get_req("/session/issue")).await;
    assert_eq!(status, StatusCode::OK);

    let session = challenge["sessionId"].as_str().unwrap();
    let issued = challenge["issued"].as_i64().unwrap();
    let difficulty = u32::try_from(challenge["difficulty"].as_u64().unwrap()).unwrap();
    let found = pow_core::solve(&format!("{session}.{issued}"), difficulty);

    json!({
        "sessionId": session,
        "issued": issued,
        "checksum": challenge["checksum"],
        "solution": found.solution,
        "hash": found.hash,
    })
}

async fn claimed(h: &Harness) -> Value {
    let body = solved_claim(&h.app).await;
    let (status, _, issued) = send(&h.app, post_json("/session/claim", &body)).await;
    assert_eq!(status, StatusCode::OK, "claim failed: {issued}");
    issued
}

#[tokio::test]
async fn health_reports_version() {
    let h = harness().await;
    let (status, _, body) = send(&h.app, get_req("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn claim_issues_hour_token_and_stores_refresh_token() {
    // GIVEN: a solved challenge
    let h = harness().await;

    // WHEN: it is claimed
    let issued = claimed(&h).await;

    // THEN: one hour token, 64-char refresh token kept under session:{id}
    let session = issued["session"].as_str().unwrap();
    let refresh = issued["refreshToken"].as_str().unwrap();
    assert_eq!(issued["expiresIn"], 3600);
    assert_eq!(refresh.len(), 64);
    assert_eq!(session.len(), 5);
    assert_eq!(
        h.backend.get_string(&format!("session:{session}")).as_deref(),
        Some(refresh)
    );
    assert!(issued["token"].as_str().is_some_and(|t| !t.is_empty()));
}

#[tokio::test]
async fn replayed_claim_is_gone() {
    let h = harness().await;
    let body = solved_claim(&h.app).await;

    let (first, _, _) = send(&h.app, post_json("/session/claim", &body)).await;
    let (second, _, err) = send(&h.app, post_json("/session/claim", &body)).await;

    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::GONE);
    assert_eq!(err["error"], "code_taken");
}

#[tokio::test]
async fn tampered_claim_is_rejected_before_the_store() {
    // GIVEN: a solved challenge whose candidate was swapped
    let h = harness().await;
    let mut body = solved_claim(&h.app).await;
    body["sessionId"] = json!("zzzzz");

    // WHEN
    let (status, _, err) = send(&h.app, post_json("/session/claim", &body)).await;

    // THEN
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "checksum_mismatch");
    assert_eq!(h.backend.ttl("session:zzzzz"), -2);
}

#[tokio::test]
async fn refresh_rotates_and_rejects_replay() {
    let h = harness().await;
    let issued = claimed(&h).await;
    let uri = format!(
        "/session/refresh?sessionToken={}&refreshToken={}",
        issued["token"].as_str().unwrap(),
        issued["refreshToken"].as_str().unwrap()
    );

    // WHEN: refreshed twice with the same refresh token
    let (first, _, rotated) = send(&h.app, Request::post(&uri).body(Body::empty()).unwrap()).await;
    let (second, _, err) = send(&h.app, Request::post(&uri).body(Body::empty()).unwrap()).await;

    // THEN: the first rotates, the replay is refused
    assert_eq!(first, StatusCode::OK);
    assert_eq!(rotated["session"], issued["session"]);
    assert_ne!(rotated["refreshToken"], issued["refreshToken"]);
    assert_eq!(second, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_refresh_token");
}

#[tokio::test]
async fn refresh_requires_both_tokens() {
    let h = harness().await;
    let (status, _, err) = send(
        &h.app,
        Request::post("/session/refresh?sessionToken=abc")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "bad_request");
}

#[tokio::test]
async fn update_publishes_to_session_channel() {
    // GIVEN: a claimed session
    let h = harness().await;
    let issued = claimed(&h).await;
    let session = issued["session"].as_str().unwrap();

    // WHEN: the host posts an update with its session token
    let request = Request::post("/session/update")
        .header("X-Session-Token", issued["token"].as_str().unwrap())
        .body(Body::from(r#"{"position":42}"#))
        .unwrap();
    let (status, _, answer) = send(&h.app, request).await;

    // THEN: the body reached the listener channel and the relay answer came back
    assert_eq!(status, StatusCode::OK);
    assert_eq!(answer["channel"], "ok");
    assert_eq!(h.relay.published_to(session), vec![r#"{"position":42}"#.to_string()]);
}

#[tokio::test]
async fn update_without_session_token_is_bad_request() {
    let h = harness().await;
    let request = Request::post("/session/update")
        .body(Body::from("{}"))
        .unwrap();
    let (status, _, _) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn update_with_forged_token_is_unauthorized() {
    let h = harness().await;
    let request = Request::post("/session/update")
        .header("X-Session-Token", "not.a.token")
        .body(Body::from("{}"))
        .unwrap();
    let (status, _, _) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(h.relay.published.lock().is_empty());
}

#[tokio::test]
async fn listener_request_reaches_host_then_is_rate_limited() {
    // GIVEN: a live session
    let h = harness().await;
    let issued = claimed(&h).await;
    let session = issued["session"].as_str().unwrap().to_string();
    h.relay.active.lock().insert(session.clone());
    let body = json!({
        "session": session,
        "provider": "google",
        "token": google_token("listener-1"),
        "request": "skip",
    });

    // WHEN: the same listener asks twice
    let (first, _, _) = send(&h.app, post_json("/session/request", &body)).await;
    let (second, headers, err) = send(&h.app, post_json("/session/request", &body)).await;

    // THEN: the first is forwarded to the host channel, the second is limited
    assert_eq!(first, StatusCode::OK);
    assert_eq!(h.relay.published_to(&format!("host_{session}")), vec!["skip".to_string()]);
    assert_eq!(second, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(err["error"], "rate_limited");
    assert_eq!(
        headers.get(header::RETRY_AFTER).and_then(|v| v.to_str().ok()),
        Some("60")
    );
}

#[tokio::test]
async fn inactive_session_gives_the_quota_back() {
    // GIVEN: a session nobody listens to
    let h = harness().await;
    let issued = claimed(&h).await;
    let session = issued["session"].as_str().unwrap().to_string();
    let body = json!({
        "session": session,
        "provider": "google",
        "token": google_token("listener-2"),
        "request": "play",
    });

    // WHEN: the listener is refused, then the session goes live
    let (inactive, _, err) = send(&h.app, post_json("/session/request", &body)).await;
    h.relay.active.lock().insert(session.clone());
    let (retry, _, _) = send(&h.app, post_json("/session/request", &body)).await;

    // THEN: the failed call did not consume the window
    assert_eq!(inactive, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "inactive_session");
    assert_eq!(retry, StatusCode::OK);
}

#[tokio::test]
async fn listener_request_with_bad_identity_is_unauthorized() {
    let h = harness().await;
    let body = json!({
        "session": "abcde",
        "provider": "twitch",
        "token": google_token("listener-3"),
        "request": "play",
    });
    let (status, _, err) = send(&h.app, post_json("/session/request", &body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(err["error"], "bad_issuer");
}

#[tokio::test]
async fn unknown_provider_is_bad_request() {
    let h = harness().await;
    let body = json!({
        "session": "abcde",
        "provider": "myspace",
        "token": "x",
        "request": "play",
    });
    let (status, _, _) = send(&h.app, post_json("/session/request", &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn config_round_trip_and_interval_applies() {
    // GIVEN: a claimed session with no config yet
    let h = harness().await;
    let issued = claimed(&h).await;
    let session = issued["session"].as_str().unwrap().to_string();
    let (missing, _, _) = send(&h.app, get_req(&format!("/session/config?session={session}"))).await;
    assert_eq!(missing, StatusCode::NOT_FOUND);

    // WHEN: the host sets a 5 second interval
    let request = Request::post("/session/config")
        .header("X-Session-Token", issued["token"].as_str().unwrap())
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"requestInterval":5}"#))
        .unwrap();
    let (set, _, _) = send(&h.app, request).await;

    // THEN: it reads back and governs the rate window
    assert_eq!(set, StatusCode::OK);
    let (status, _, config) =
        send(&h.app, get_req(&format!("/session/config?session={session}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config, json!({"requestInterval": 5}));

    h.relay.active.lock().insert(session.clone());
    let body = json!({
        "session": session,
        "provider": "google",
        "token": google_token("listener-4"),
        "request": "pause",
    });
    send(&h.app, post_json("/session/request", &body)).await;
    let (_, headers, _) = send(&h.app, post_json("/session/request", &body)).await;
    assert_eq!(
        headers.get(header::RETRY_AFTER).and_then(|v| v.to_str().ok()),
        Some("5")
    );
}

#[tokio::test]
async fn config_without_session_query_is_bad_request() {
    let h = harness().await;
    let (status, _, _) = send(&h.app, get_req("/session/config")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn zero_interval_is_refused() {
    let h = harness().await;
    let issued = claimed(&h).await;
    let request = Request::post("/session/config")
        .header("X-Session-Token", issued["token"].as_str().unwrap())
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"requestInterval":0}"#))
        .unwrap();
    let (status, _, _) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn twitch_exchange_unconfigured_is_unavailable() {
    let h = harness().await;
    let (status, _, err) = send(
        &h.app,
        Request::post("/auth/twitch?code=abc")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(err["error"], "not_configured");
}

#[tokio::test]
async fn cors_preflight_allows_session_token_header() {
    let h = harness().await;
    let request = Request::options("/session/update")
        .header(header::ORIGIN, "https://player.example")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "x-session-token")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(
        headers
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
    assert_eq!(
        headers
            .get(header::ACCESS_CONTROL_MAX_AGE)
            .and_then(|v| v.to_str().ok()),
        Some("7200")
    );
}
