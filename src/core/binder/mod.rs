// src/core/binder/mod.rs

//! The binder registry: named keyed-document stores.
//!
//! A binder maps document ids to documents. The in-memory implementation
//! backs the protocol surface (`find_by_id`, `create_binder`, `list_binders`)
//! and the binder-scan queries in the CQRS registry.

use crate::core::errors::LogBusError;
use crate::core::protocol::Document;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// One named keyed-document store.
#[derive(Debug, Default)]
pub struct Binder {
    docs: DashMap<String, Document>,
}

impl Binder {
    /// Fetches a document by id; `Ok(None)` means not found.
    pub async fn get(&self, doc_id: &str) -> Result<Option<Document>, LogBusError> {
        Ok(self.docs.get(doc_id).map(|entry| entry.value().clone()))
    }

    /// Stores a document under `doc_id`, replacing any previous version.
    pub async fn put(&self, doc_id: &str, doc: Document) -> Result<(), LogBusError> {
        self.docs.insert(doc_id.to_string(), doc);
        Ok(())
    }

    /// Snapshot of all documents, in arbitrary order. Used by binder-scan
    /// queries.
    pub fn all_docs(&self) -> Vec<Document> {
        self.docs.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// The registry of binders, shared across all connections.
#[derive(Debug, Default)]
pub struct BinderRegistry {
    binders: DashMap<String, Arc<Binder>>,
}

impl BinderRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get_binder(&self, name: &str) -> Option<Arc<Binder>> {
        self.binders.get(name).map(|entry| entry.value().clone())
    }

    /// Creates the binder if absent. Returns `true` if it was created,
    /// `false` if it already existed.
    pub async fn create_binder(&self, name: &str) -> Result<bool, LogBusError> {
        let mut created = false;
        self.binders.entry(name.to_string()).or_insert_with(|| {
            created = true;
            Arc::new(Binder::default())
        });
        if created {
            debug!("Created binder '{name}'");
        }
        Ok(created)
    }

    pub fn list_binders(&self) -> Vec<String> {
        self.binders.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::DocumentExt;

    #[tokio::test]
    async fn create_then_fetch_round_trip() {
        let registry = BinderRegistry::new();
        assert!(registry.create_binder("accounts").await.unwrap());
        assert!(!registry.create_binder("accounts").await.unwrap());

        let binder = registry.get_binder("accounts").unwrap();
        assert!(binder.get("A1").await.unwrap().is_none());

        let mut doc = Document::new();
        doc.insert("balance".into(), 100.into());
        binder.put("A1", doc).await.unwrap();

        let fetched = binder.get("A1").await.unwrap().unwrap();
        assert_eq!(fetched.get_i64("balance"), Some(100));
    }

    #[test]
    fn unknown_binder_is_absent() {
        let registry = BinderRegistry::new();
        assert!(registry.get_binder("accounts").is_none());
        assert!(registry.list_binders().is_empty());
    }
}
