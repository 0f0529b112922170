//! Session Gate Library
//!
//! Admission control and session lifecycle for synchronized playback rooms.
//!
//! # Features
//!
//! - **Proof of work**: session creation costs the client a hash search
//! - **Atomic claims**: one winner per session id, single-use refresh tokens
//! - **Rate limiting**: per (session, identity) windows with reversal on
//!   downstream failure
//! - **Identity**: Google and Twitch ID tokens checked against cached key sets
//! - **Relay**: host updates and listener requests forwarded to a pub-sub relay

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod pow;
pub mod rate_limit;
pub mod relay;
pub mod session;
pub mod store;
pub mod token;
pub mod twitch;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Internal(format!("tracing already initialised: {e}")))
}
