// src/core/state.rs

//! Defines `ServerState`, the shared handle every connection task holds.
//!
//! The state owns the collaborator registries (channels, binders, CQRS,
//! durable registrations, the auth provider) and the map of connected
//! clients. Per-connection protocol state never lives here: it is owned by
//! each connection's task.

use crate::config::Config;
use crate::core::auth::{AuthProvider, StaticAuthProvider};
use crate::core::binder::BinderRegistry;
use crate::core::channel::{ChannelRegistry, DurableRegistry};
use crate::core::cqrs::CqrsManager;
use crate::core::errors::LogBusError;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Default)]
pub struct ServerStats {
    total_connections: AtomicU64,
}

impl ServerStats {
    pub fn increment_total_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }
}

/// The shared server state handed to every connection handler.
pub struct ServerState {
    pub config: Config,
    pub channels: ChannelRegistry,
    pub binders: Arc<BinderRegistry>,
    pub cqrs: CqrsManager,
    pub durables: DurableRegistry,
    pub auth: Arc<dyn AuthProvider>,
    /// Kill-channel senders for each live connection, keyed by session id.
    pub clients: DashMap<u64, broadcast::Sender<()>>,
    pub stats: ServerStats,
}

impl ServerState {
    /// Builds the state from config: wires the auth provider and pre-creates
    /// the declared channels and binders.
    pub async fn initialize(config: Config) -> Result<Arc<Self>, LogBusError> {
        let auth: Arc<dyn AuthProvider> = Arc::new(StaticAuthProvider::new(&config.auth));
        Self::initialize_with_auth(config, auth).await
    }

    /// Same as [`initialize`](Self::initialize) but with a caller-supplied
    /// auth provider, for embedders and tests.
    pub async fn initialize_with_auth(
        config: Config,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Arc<Self>, LogBusError> {
        let state = Arc::new(Self {
            channels: ChannelRegistry::new(),
            binders: Arc::new(BinderRegistry::new()),
            cqrs: CqrsManager::new(),
            durables: DurableRegistry::new(),
            auth,
            clients: DashMap::new(),
            stats: ServerStats::default(),
            config,
        });

        for channel in &state.config.channels {
            state.channels.create_channel(channel).await?;
        }
        for binder in &state.config.binders {
            state.binders.create_binder(binder).await?;
        }
        Ok(state)
    }
}
