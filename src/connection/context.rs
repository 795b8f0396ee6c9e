// src/connection/context.rs

//! Execution-context confinement for per-connection state.
//!
//! Every connection's state is owned by exactly one task. The task runs its
//! whole lifetime inside [`scope`], and every entry point into the state
//! machine calls [`assert_context`] first. A mismatch is a programming
//! invariant violation, not a recoverable error, so it panics.

use std::future::Future;

tokio::task_local! {
    /// The session id of the connection whose context the current task is.
    static CONNECTION_CONTEXT: u64;
}

/// Runs `fut` pinned to the connection context for `session_id`.
pub async fn scope<F>(session_id: u64, fut: F) -> F::Output
where
    F: Future,
{
    CONNECTION_CONTEXT.scope(session_id, fut).await
}

/// Asserts that the current task is the connection context for `session_id`.
pub fn assert_context(session_id: u64) {
    let current = CONNECTION_CONTEXT.try_with(|id| *id).ok();
    if current != Some(session_id) {
        panic!(
            "connection {session_id} state touched from the wrong execution context ({current:?})"
        );
    }
}
