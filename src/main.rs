//! Tabletop Sync demo client
//!
//! Joins the session given on the command line and logs every sync event
//! until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tabletop_sync::{
    network::WsConnector,
    sync::{HttpSessionApi, SyncEvent},
    ClientConfig, SyncClient, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Tabletop Sync v{}", VERSION);

    let session_id = std::env::args()
        .nth(1)
        .context("usage: tabletop-sync <session-id>")?;

    let config = ClientConfig::from_env()?;
    info!("Server: {}", config.connection.url);
    info!("API: {}", config.api_url);

    let api = HttpSessionApi::new(&config.api_url, config.access_token.clone())?;
    let client = SyncClient::init(config, Arc::new(api), Arc::new(WsConnector::default()));
    let mut events = client.events();

    let session = client.join_session(&session_id).await?;
    info!(
        "Joined '{}' ({} players, {:?})",
        session.name,
        session.players.len(),
        session.status
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(SyncEvent::EntitiesUpdated { seq }) => {
                    info!("Entities @{}: {} total", seq, client.entities().len());
                }
                Ok(SyncEvent::ConnectionChanged(state)) => {
                    info!("Connection {} (latency {:?} ms)", state.as_str(), client.latency());
                }
                Ok(SyncEvent::SessionChanged(session)) => {
                    info!("Session: {:?}", session.map(|s| s.name));
                }
                Ok(SyncEvent::ResyncRequested(reason)) => {
                    warn!("Resync requested: {:?}", reason);
                }
                Err(e) => warn!("Event stream: {}", e),
            }
        }
    }

    client.leave_session();
    client.dispose();
    Ok(())
}
