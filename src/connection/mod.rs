// src/connection/mod.rs

//! Manages the lifecycle of a single client connection: frame dispatch,
//! authorization gating, subscription and query-execution tables, and the
//! execution-context confinement of all per-connection state.

// Declare the private sub-modules of the `connection` module.
mod context;
mod guard;
mod handler;
mod query;
mod session;
mod subscription;

// Publicly re-export the primary types from the sub-modules.
// This creates a clean public API for the `connection` module, hiding the
// internal file structure from the rest of the crate.
pub use context::{assert_context, scope};
pub use guard::ConnectionGuard;
pub use handler::{ConnEvent, ConnectionHandler};
pub use query::QueryExecution;
pub use session::SessionState;
pub use subscription::{SubDescriptor, Subscription};
