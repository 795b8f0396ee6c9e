// src/core/cqrs/mod.rs

//! The CQRS registry: named streaming queries and command handlers.
//!
//! Queries stream zero or more result documents; the connection layer paces
//! their delivery through the ack window. Commands are fire-and-forget from
//! the registry's point of view; the connection answers the client once the
//! handler resolves.

use crate::core::binder::BinderRegistry;
use crate::core::errors::LogBusError;
use crate::core::protocol::{Document, matches_document};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream};
use std::sync::Arc;

/// A registered query: turns a parameters document into a stream of result
/// documents.
pub trait QueryHandler: Send + Sync {
    fn run(&self, params: Document) -> BoxStream<'static, Result<Document, LogBusError>>;
}

/// A registered command handler.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: Document) -> Result<(), LogBusError>;
}

/// The built-in query shape: scan a binder and stream every document matching
/// the parameters document, treated as a field-equality matcher.
pub struct BinderScanQuery {
    binders: Arc<BinderRegistry>,
    binder_name: String,
}

impl BinderScanQuery {
    pub fn new(binders: Arc<BinderRegistry>, binder_name: &str) -> Self {
        Self {
            binders,
            binder_name: binder_name.to_string(),
        }
    }
}

impl QueryHandler for BinderScanQuery {
    fn run(&self, params: Document) -> BoxStream<'static, Result<Document, LogBusError>> {
        let Some(binder) = self.binders.get_binder(&self.binder_name) else {
            let name = self.binder_name.clone();
            return Box::pin(stream::once(async move {
                Err(LogBusError::NoSuchBinder(name))
            }));
        };
        let matching: Vec<_> = binder
            .all_docs()
            .into_iter()
            .filter(|doc| matches_document(&params, doc))
            .map(Ok)
            .collect();
        Box::pin(stream::iter(matching))
    }
}

/// The registry of queries and command handlers, shared across connections.
#[derive(Default)]
pub struct CqrsManager {
    queries: DashMap<String, Arc<dyn QueryHandler>>,
    commands: DashMap<String, Arc<dyn CommandHandler>>,
}

impl CqrsManager {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register_query(&self, name: &str, query: Arc<dyn QueryHandler>) {
        self.queries.insert(name.to_string(), query);
    }

    pub fn get_query(&self, name: &str) -> Option<Arc<dyn QueryHandler>> {
        self.queries.get(name).map(|entry| entry.value().clone())
    }

    pub fn register_command(&self, name: &str, handler: Arc<dyn CommandHandler>) {
        self.commands.insert(name.to_string(), handler);
    }

    /// Dispatches a command document to its registered handler.
    pub async fn call_command_handler(
        &self,
        name: &str,
        command: Document,
    ) -> Result<(), LogBusError> {
        let handler = self
            .commands
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| LogBusError::ServerError(format!("no command handler '{name}'")))?;
        handler.handle(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn binder_scan_query_filters_by_params() {
        let binders = Arc::new(BinderRegistry::new());
        binders.create_binder("orders").await.unwrap();
        let binder = binders.get_binder("orders").unwrap();

        let mut open = Document::new();
        open.insert("status".into(), "open".into());
        binder.put("o1", open.clone()).await.unwrap();

        let mut closed = Document::new();
        closed.insert("status".into(), "closed".into());
        binder.put("o2", closed).await.unwrap();

        let query = BinderScanQuery::new(binders, "orders");
        let mut params = Document::new();
        params.insert("status".into(), "open".into());

        let results: Vec<_> = query.run(params).collect().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), &open);
    }

    #[tokio::test]
    async fn unknown_command_handler_is_a_server_error() {
        let cqrs = CqrsManager::new();
        let err = cqrs
            .call_command_handler("register", Document::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LogBusError::ServerError(_)));
    }
}
