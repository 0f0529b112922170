//! Gate server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::{AppState, create_router};
use crate::config::Config;
use crate::{Error, Result};

/// Session gate server
pub struct Gate {
    config: Config,
}

impl Gate {
    /// Create a server for `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Bind, warm the key sets and serve until SIGINT/SIGTERM.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let state = AppState::from_config(&self.config).await?;
        state.identity.warm_up();

        let app = create_router(Arc::clone(&state));
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("SESSION GATE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = self.config.server.port, "Listening");
        info!(difficulty = state.pow.difficulty(), "Proof of work");
        if state.twitch.is_none() {
            warn!("Twitch code exchange disabled");
        }
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Session gate stopped");
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
