//! WebVPN relay server
//!
//! Serves agent WebSocket connections, the browser-facing tunnel routes and the
//! dashboard status endpoints from one listener.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use webvpn_relay::config::{Args, Command, RelayConfig};
use webvpn_relay::credentials::{CredentialStore, FileCredentialStore, issue_key};
use webvpn_relay::handlers::liveness_loop;
use webvpn_relay::{RelayState, build_router};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match args.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => serve(RelayConfig::from_args(&args)?).await,
        Command::IssueKey { tunnel } => print_new_key(&args, &tunnel).await,
    }
}

async fn serve(config: RelayConfig) -> Result<()> {
    let listen = config.listen;
    let state = Arc::new(RelayState::from_config(config).await?);

    tokio::spawn(liveness_loop(state.clone()));

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!(
        "WebVPN relay listening on {} (base path {:?})",
        listen, state.config.base_path
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Relay server failed")?;

    info!("Relay stopped");
    Ok(())
}

/// Generate a key for `tunnel`, persist its hash and print the plaintext once
async fn print_new_key(args: &Args, tunnel: &str) -> Result<()> {
    webvpn_common::validation::validate_tunnel_id(tunnel)?;

    let store = FileCredentialStore::load(args.credentials_file.clone()).await?;
    let issued = issue_key(tunnel)?;
    store.insert(issued.credential.clone()).await?;

    info!(
        "Issued key {} for tunnel {} in {}",
        issued.credential.id,
        tunnel,
        args.credentials_file.display()
    );
    println!("{}", issued.key);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
