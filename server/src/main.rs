//! Beeline Server - Main entry point.
//!
//! This binary starts the Beeline chat server with:
//! - Structured JSON logging
//! - Admin account bootstrap from `BEELINE_ADMIN_PW`
//! - Background login throttle cleanup
//! - Graceful shutdown (SIGTERM/SIGINT) that closes every chat connection
//!   and revokes every session
//!
//! # Configuration
//!
//! See [`beeline_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! BEELINE_ADMIN_PW="change-me-please" PORT=5961 cargo run --release --bin beeline-server
//! ```

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use beeline_server::broadcast::TopicRegistry;
use beeline_server::config::Config;
use beeline_server::routes::{create_router, AppState};

/// Cleanup interval for idle login throttle entries.
const THROTTLE_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                          - HTTP server port (default: 5961)");
            eprintln!("  BEELINE_ADMIN_PW              - Password for the 'admin' account");
            eprintln!("  BEELINE_OPEN_SIGNUP           - Allow self-service signup ('true')");
            eprintln!("  BEELINE_MAX_FAILED_LOGINS     - Lockout threshold (default: 3)");
            eprintln!("  BEELINE_MAX_USERS             - Account cap (default: 100)");
            eprintln!("  BEELINE_MAILBOX_CAPACITY      - Queued messages per connection (default: 64)");
            eprintln!("  BEELINE_MAX_DROPPED_MESSAGES  - Drops before a slow client is cut (default: 16)");
            eprintln!("  BEELINE_LOGIN_RATE            - Login attempts/sec per user (default: 1.0)");
            eprintln!("  BEELINE_LOGIN_BURST           - Login burst per user (default: 5)");
            eprintln!("  RUST_LOG                      - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "Server error");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(
        port = config.port,
        open_signup = config.open_signup,
        max_failed_logins = config.max_failed_logins,
        mailbox_capacity = config.mailbox_capacity,
        "Beeline server starting"
    );

    let state = AppState::new(config.clone());

    if let Some(password) = config.admin_password.as_deref() {
        let created = state
            .verifier
            .ensure_admin(password)
            .context("failed to create admin account")?;
        if created {
            info!("Admin account ready");
        }
    }

    let cleanup_handle = state.throttle.spawn_cleanup_task(THROTTLE_CLEANUP_INTERVAL);

    let registry = state.registry.clone();
    let verifier = state.verifier.clone();
    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;
    info!(port = config.port, address = %bind_addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry.clone()))
        .await
        .context("server terminated unexpectedly")?;

    info!("Server shutting down gracefully");
    cleanup_handle.abort();

    // Connections upgraded after the signal.
    registry.close_all();
    verifier.revoke_all();

    Ok(())
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` (default `info,tower_http=debug`).
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves on SIGINT or SIGTERM, after closing every chat connection.
async fn shutdown_signal(registry: TopicRegistry) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }

    let closed = registry.close_all();
    info!(closed, "Closed chat connections");
}
