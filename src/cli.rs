//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Session gate - proof-of-work gated sessions for synchronized playback
#[derive(Parser, Debug)]
#[command(name = "session-gate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "SESSION_GATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "SESSION_GATE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "SESSION_GATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gate server (default)
    Serve,

    /// Solve a challenge the way clients do
    Solve {
        /// Nonce (`{sessionId}.{issued}`)
        nonce: String,

        /// Required leading zero hex digits (at most 64)
        #[arg(value_parser = clap::value_parser!(u32).range(..=i64::from(pow_core::MAX_DIFFICULTY)))]
        difficulty: u32,
    },
}
