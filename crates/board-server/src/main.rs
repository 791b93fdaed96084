//! # Board Server
//!
//! Realtime message board server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! board
//!
//! # Run with custom config
//! board --config /path/to/board.toml
//!
//! # Run with environment variables
//! BOARD_PORT=8080 BOARD_HOST=0.0.0.0 BOARD_DATABASE=chat.db board
//! ```

use anyhow::Result;
use board_server::{config::Config, handlers, metrics};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Realtime message board server.
#[derive(Parser, Debug)]
#[command(name = "board")]
#[command(version, about)]
struct Args {
    /// Path to a TOML config file (otherwise the default locations are searched)
    #[arg(short, long, env = "BOARD_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "board=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    tracing::info!(
        "Starting Board server on {}:{} (database: {})",
        config.host,
        config.port,
        config.database.path
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
