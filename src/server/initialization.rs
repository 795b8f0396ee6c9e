// src/server/initialization.rs

//! Builds the server state and binds the listener before the main loop runs.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::state::ServerState;
use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

/// Initializes server state, pre-creates declared channels and binders, and
/// binds the TCP listener.
pub async fn setup(config: Config) -> Result<ServerContext> {
    let state = ServerState::initialize(config).await?;

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!("logbus listening on {}", listener.local_addr()?);

    let (shutdown_tx, _) = broadcast::channel(1);

    Ok(ServerContext {
        state,
        listener,
        shutdown_tx,
    })
}
