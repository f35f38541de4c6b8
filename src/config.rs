//! CLI and environment configuration.

use std::path::PathBuf;

use clap::Parser;

/// Capacity of the status-update broadcast channel. A session that falls
/// further behind than this starts missing updates (and logs that it did).
pub(crate) const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Presence-aware message relay.
///
/// Clients hold a WebSocket open, register an identity, exchange text
/// messages, and receive messages sent while they were offline once they
/// reconnect.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(name = "hermod", version, about)]
pub struct Cli {
    /// HTTP server bind address [env: HERMOD_BIND] [default: 127.0.0.1:5600]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// SQLite database path [env: HERMOD_DB] [default: ./hermod.db]
    #[arg(long, short = 'd')]
    pub db: Option<PathBuf>,
}

pub struct Config {
    pub bind_addr: String,
    pub db_path: PathBuf,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Self {
        let bind_addr = cli
            .bind
            .or_else(|| std::env::var("HERMOD_BIND").ok())
            .unwrap_or_else(|| "127.0.0.1:5600".to_string());

        let db_path = cli
            .db
            .or_else(|| std::env::var("HERMOD_DB").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("hermod.db"));

        Self { bind_addr, db_path }
    }
}
