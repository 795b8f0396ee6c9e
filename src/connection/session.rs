// src/connection/session.rs

//! Defines the state associated with a single client session.
//!
//! All of this state is exclusively owned by the connection's task; nothing
//! here is shared or locked. Subscriptions and query executions are reached
//! by id, never by reference from outside the table.

use crate::connection::query::QueryExecution;
use crate::connection::subscription::Subscription;
use crate::core::LogBusError;
use crate::core::auth::{UnauthorizedUser, User};
use std::collections::HashMap;
use std::sync::Arc;

/// Holds the state specific to a single client session.
pub struct SessionState {
    /// The authenticated identity; the `UnauthorizedUser` sentinel until a
    /// `connect` frame succeeds, and again after close.
    pub user: Arc<dyn User>,
    /// Live subscriptions keyed by connection-scoped subscription id.
    pub subscriptions: HashMap<u32, Subscription>,
    /// In-flight query executions keyed by the client-supplied query id.
    pub queries: HashMap<i64, QueryExecution>,
    /// The next subscription id to assign; sequential from 0.
    sub_seq: u32,
    /// Generation counter for query executions; see [`finish_query`](Self::finish_query).
    query_gen: u64,
    /// True once the connection has been closed. Close is idempotent.
    pub closed: bool,
}

impl SessionState {
    pub(crate) fn new() -> Self {
        Self {
            user: Arc::new(UnauthorizedUser),
            subscriptions: HashMap::new(),
            queries: HashMap::new(),
            sub_seq: 0,
            query_gen: 0,
            closed: false,
        }
    }

    /// Allocates the next subscription id. Refusing to wrap the counter and
    /// risk id collision is preferable to continuing; exhaustion is
    /// connection-fatal.
    pub(crate) fn next_sub_id(&mut self) -> Result<u32, LogBusError> {
        let id = self.sub_seq;
        self.sub_seq = self
            .sub_seq
            .checked_add(1)
            .ok_or(LogBusError::SubIdExhausted)?;
        Ok(id)
    }

    /// Allocates a generation tag for a new query execution.
    pub(crate) fn next_query_generation(&mut self) -> u64 {
        self.query_gen = self.query_gen.wrapping_add(1);
        self.query_gen
    }

    /// Removes the execution for `query_id` only when `generation` names the
    /// execution that finished. A completion raced out of an execution that a
    /// reused query id already replaced must not tear down the replacement.
    pub(crate) fn finish_query(&mut self, query_id: i64, generation: u64) -> bool {
        match self.queries.get(&query_id) {
            Some(execution) if execution.generation() == generation => {
                self.queries.remove(&query_id);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cqrs::QueryHandler;
    use crate::core::protocol::Document;
    use futures::stream::{self, BoxStream};
    use tokio::sync::mpsc;

    struct NoResults;

    impl QueryHandler for NoResults {
        fn run(&self, _params: Document) -> BoxStream<'static, Result<Document, LogBusError>> {
            Box::pin(stream::empty())
        }
    }

    #[test]
    fn sub_ids_are_sequential_from_zero() {
        let mut session = SessionState::new();
        assert_eq!(session.next_sub_id().unwrap(), 0);
        assert_eq!(session.next_sub_id().unwrap(), 1);
        assert_eq!(session.next_sub_id().unwrap(), 2);
    }

    #[test]
    fn sub_id_exhaustion_is_an_error_not_a_wrap() {
        let mut session = SessionState::new();
        session.sub_seq = u32::MAX;
        assert!(matches!(
            session.next_sub_id(),
            Err(LogBusError::SubIdExhausted)
        ));
    }

    #[tokio::test]
    async fn stale_query_completion_does_not_remove_the_replacement() {
        let mut session = SessionState::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn QueryHandler> = Arc::new(NoResults);

        // The first execution under id 5 was replaced before it finished.
        let replaced_gen = session.next_query_generation();
        let live_gen = session.next_query_generation();
        let replacement =
            QueryExecution::spawn(handler, Document::new(), 5, live_gen, 1024, tx);
        session.queries.insert(5, replacement);

        assert!(!session.finish_query(5, replaced_gen));
        assert!(session.queries.contains_key(&5));

        assert!(session.finish_query(5, live_gen));
        assert!(!session.queries.contains_key(&5));
    }
}
