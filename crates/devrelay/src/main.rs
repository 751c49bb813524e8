#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use devrelay::config::{Args, ServerConfig};
use devrelay::metrics::{start_health_server, HealthState};
use devrelay::server::ServerState;
use devrelay::run_with_shutdown;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config: ServerConfig = Args::parse().into();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }
    info!(?config, "starting relay");

    let state = Arc::new(ServerState::new(config.clone()));

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    let health_state = HealthState::new();

    tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if let Err(e) = start_health_server(config.health_addr, health_state).await {
                warn!("health server error: {}", e);
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    let server = tokio::spawn(run_with_shutdown(listener, state, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    health_state.set_ready(false);
    let _ = shutdown_tx.send(());

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server error: {}", e),
        Err(e) => tracing::error!("server task failed: {}", e),
    }

    Ok(())
}
