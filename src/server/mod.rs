// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;

pub mod connection_loop;
pub mod context;
pub mod initialization;

pub use context::ServerContext;

/// The main server startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    // 1. Initialize server state, bind the listener.
    let server_context = initialization::setup(config).await?;

    // 2. Start the main connection acceptance loop. This function will run until shutdown.
    connection_loop::run(server_context).await;

    Ok(())
}
