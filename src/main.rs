// ABOUTME: CLI entry point for sqlite-relay
// ABOUTME: Parses commands, installs logging and routes to the watch/sync roles

use clap::{Parser, Subcommand};
use sqlite_relay::commands;
use sqlite_relay::config::{RelayArgs, Settings};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "sqlite-relay")]
#[command(about = "Keep read-only SQLite replicas in sync with a primary", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(flatten)]
    relay: RelayArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a database to replicas and notify them when it changes
    Watch {
        /// Database file to watch (or sync_file from --config-file)
        db: Option<PathBuf>,
    },
    /// Keep a local read-only copy of a primary's database
    Sync {
        /// Primary as host:port (or remote_conn from --config-file)
        remote: Option<String>,
        /// Local replica path (or sync_file from --config-file)
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, shutting down");
            on_signal.cancel();
        }
    });

    match cli.command {
        Commands::Watch { db } => {
            let settings = Settings::resolve(&cli.relay, db, None)?;
            commands::watch(&settings, shutdown).await
        }
        Commands::Sync { remote, db } => {
            let settings = Settings::resolve(&cli.relay, db, remote)?;
            commands::sync(&settings, shutdown).await
        }
    }
}
