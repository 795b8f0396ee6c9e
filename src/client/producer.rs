// src/client/producer.rs

use crate::core::LogBusError;
use crate::core::protocol::Document;
use std::sync::Arc;

use super::ClientConnection;

/// A handle for publishing events to a single channel.
///
/// Producers are cheap; a connection can hand out many of them. Transactional
/// publishing is not implemented yet, so the transaction methods report that
/// no transaction support is available.
pub struct Producer {
    connection: Arc<ClientConnection>,
    channel: String,
    id: u64,
}

impl Producer {
    pub(super) fn new(connection: Arc<ClientConnection>, channel: &str, id: u64) -> Self {
        Self {
            connection,
            channel: channel.to_string(),
            id,
        }
    }

    /// The channel this producer publishes to.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Publishes one event document and awaits the server ack.
    pub async fn emit(&self, event: Document) -> Result<(), LogBusError> {
        self.connection.emit(&self.channel, event).await
    }

    /// Whether this producer currently has an open transaction. Always false.
    pub fn in_transaction(&self) -> bool {
        false
    }

    pub async fn start_tx(&self) -> Result<(), LogBusError> {
        Err(LogBusError::ServerError(
            "transactions are not supported".into(),
        ))
    }

    pub async fn commit_tx(&self) -> Result<(), LogBusError> {
        Err(LogBusError::ServerError(
            "transactions are not supported".into(),
        ))
    }

    pub async fn abort_tx(&self) -> Result<(), LogBusError> {
        Err(LogBusError::ServerError(
            "transactions are not supported".into(),
        ))
    }
}
