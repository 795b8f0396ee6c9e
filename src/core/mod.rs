// src/core/mod.rs

//! The central module containing the core logic and data structures of logbus.

pub mod auth;
pub mod binder;
pub mod channel;
pub mod cqrs;
pub mod errors;
pub mod flow;
pub mod protocol;
pub mod state;

pub use errors::LogBusError;
pub use protocol::{Document, Frame, FrameType};
