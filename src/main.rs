#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};

use termgate::shell::pty::NativeSpawner;
use termgate::{AppState, Config, TokenService};

/// Browser terminal over WebSocket.
#[derive(Parser)]
#[command(name = "termgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the terminal server (default).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Mint a connection token from the configured secret and print it.
    Token {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Token lifetime in seconds, overriding `auth.token_ttl_secs`.
        #[arg(long)]
        ttl: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Token { config, ttl }) => print_token(config.as_deref(), ttl),
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("termgate: {message}");
            ExitCode::FAILURE
        }
    }
}

fn print_token(config_path: Option<&str>, ttl: Option<u64>) -> Result<(), String> {
    let config = Config::load(config_path).map_err(|e| e.to_string())?;
    let Some(ref secret) = config.auth.secret else {
        return Err("no secret configured (set auth.secret or TERMGATE_SECRET)".to_string());
    };
    let tokens = TokenService::new(Some(secret.as_str()), ttl.unwrap_or(config.auth.token_ttl_secs));
    let (token, _expires_ms) = tokens.issue();
    println!("{token}");
    Ok(())
}

async fn run_server(config_path: Option<&str>) -> Result<(), String> {
    let config = Config::load(config_path).map_err(|e| e.to_string())?;

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("termgate v{} starting", env!("CARGO_PKG_VERSION"));

    let tokens = Arc::new(TokenService::new(
        config.auth.secret.as_deref(),
        config.auth.token_ttl_secs,
    ));
    let heartbeat = Duration::from_secs(config.server.heartbeat_interval_secs.max(1));
    let listen = config.server.listen.clone();

    let state = AppState::new(config, Arc::clone(&tokens), Arc::new(NativeSpawner))
        .map_err(|e| format!("failed to resolve working directories: {e}"))?;
    info!("Uploads go to {}", state.settings.upload_dir.display());

    let listener = TcpListener::bind(&listen)
        .await
        .map_err(|e| format!("failed to bind {listen}: {e}"))?;
    info!("Listening on {listen}");

    let (token, expires_ms) = tokens.issue();
    info!("Connect with ws://{listen}/api/ws?token={token} (expires at {expires_ms} ms)");

    let heartbeat_task = state.registry.spawn_heartbeat(heartbeat);

    // Close sessions before axum waits for connections to drain; upgraded
    // WebSockets would otherwise hold shutdown open.
    let registry = state.registry.clone();
    let shutdown = async move {
        shutdown_signal().await;
        info!("Shutting down...");
        registry.shutdown().await;
    };

    let app = termgate::app(state);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    heartbeat_task.abort();
    if let Err(e) = served {
        error!("Server error: {e}");
        return Err(e.to_string());
    }
    info!("Goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
