//! Session Gate - proof-of-work gated sessions for synchronized playback

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use session_gate::{
    api::Gate,
    cli::{Cli, Command},
    config::Config,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Solve { ref nonce, difficulty }) => run_solve(nonce, difficulty),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Run the unary-counter solver and print the result as JSON
fn run_solve(nonce: &str, difficulty: u32) -> ExitCode {
    if let Err(e) = nonce.parse::<pow_core::Nonce>() {
        eprintln!("Invalid nonce: {e}");
        return ExitCode::FAILURE;
    }
    if difficulty > pow_core::MAX_DIFFICULTY {
        eprintln!(
            "Difficulty {difficulty} exceeds {}, no solution exists",
            pow_core::MAX_DIFFICULTY
        );
        return ExitCode::FAILURE;
    }
    if difficulty > 8 {
        info!(difficulty, "High difficulty, this may take a long time");
    }

    let found = pow_core::solve(nonce, difficulty);
    match serde_json::to_string_pretty(&found) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to serialize solution: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the gate server
async fn run_server(cli: Cli) -> ExitCode {
    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host {
        config.server.host = host;
    }

    match Gate::new(config).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Gate error: {e}");
            ExitCode::FAILURE
        }
    }
}
