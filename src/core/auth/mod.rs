// src/core/auth/mod.rs

//! The capability gate: authentication of connections and per-operation
//! authorization checks.
//!
//! Both calls are asynchronous contracts because real providers talk to
//! external identity systems. The connection state machine never inspects a
//! frame body while the authorization check for it is pending.

mod static_provider;

pub use static_provider::{StaticAuthProvider, hash_password};
pub(crate) use static_provider::credentials;

use crate::core::errors::LogBusError;
use crate::core::protocol::Document;
use async_trait::async_trait;
use std::sync::Arc;

/// An authenticated identity and its per-operation capability checks.
#[async_trait]
pub trait User: Send + Sync {
    fn username(&self) -> &str;

    /// Returns whether this user may perform the named protocol operation.
    /// `Err` means the check itself failed, which is connection-fatal, as is
    /// an `Ok(false)` denial.
    async fn is_authorized(&self, operation: &str) -> Result<bool, LogBusError>;
}

/// Authenticates opaque credential documents presented in `connect` frames.
///
/// `Ok(None)` is a broken provider contract (authentication neither succeeded
/// nor failed); the connection treats it as a fatal internal fault.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(
        &self,
        credentials: &Document,
    ) -> Result<Option<Arc<dyn User>>, LogBusError>;
}

/// The sentinel identity bound to a connection before `connect` succeeds and
/// re-bound on close, so any raced in-flight handler deterministically fails
/// its authorization check instead of using stale privilege.
#[derive(Debug, Default)]
pub struct UnauthorizedUser;

#[async_trait]
impl User for UnauthorizedUser {
    fn username(&self) -> &str {
        "<unauthorized>"
    }

    async fn is_authorized(&self, _operation: &str) -> Result<bool, LogBusError> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unauthorized_user_denies_everything() {
        let user = UnauthorizedUser;
        assert!(!user.is_authorized("publish").await.unwrap());
        assert!(!user.is_authorized("ping").await.unwrap());
    }
}
