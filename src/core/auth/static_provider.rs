// src/core/auth/static_provider.rs

//! A config-backed auth provider: users with Argon2 password hashes and
//! wildcard operation patterns.

use crate::config::{AuthConfig, AuthUser};
use crate::core::auth::{AuthProvider, User};
use crate::core::errors::LogBusError;
use crate::core::protocol::{Document, DocumentExt, fields};
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use rand::rngs::OsRng;
use std::sync::Arc;
use std::time::Duration;
use wildmatch::WildMatch;

/// Field names expected inside the `authInfo` credential document.
const CRED_USERNAME: &str = "username";
const CRED_PASSWORD: &str = "password";

/// Hashes a plaintext password into the PHC string stored in config files.
pub fn hash_password(password: &str) -> Result<String, LogBusError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| LogBusError::Internal(format!("password hashing failed: {e}")))
}

/// An authenticated user holding the operation patterns from its config entry.
struct StaticUser {
    username: String,
    permissions: Vec<WildMatch>,
}

#[async_trait]
impl User for StaticUser {
    fn username(&self) -> &str {
        &self.username
    }

    async fn is_authorized(&self, operation: &str) -> Result<bool, LogBusError> {
        Ok(self.permissions.iter().any(|p| p.matches(operation)))
    }
}

/// The capability gate used when authentication is disabled in config: every
/// credential document authenticates as an anonymous user allowed everything.
struct AnonymousUser;

#[async_trait]
impl User for AnonymousUser {
    fn username(&self) -> &str {
        "<anonymous>"
    }

    async fn is_authorized(&self, _operation: &str) -> Result<bool, LogBusError> {
        Ok(true)
    }
}

/// An [`AuthProvider`] over the static user list in the server config.
pub struct StaticAuthProvider {
    enabled: bool,
    users: Vec<AuthUser>,
}

impl StaticAuthProvider {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            enabled: config.enabled,
            users: config.users.clone(),
        }
    }

    fn lookup(&self, username: &str) -> Option<&AuthUser> {
        self.users.iter().find(|u| u.username == username)
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn authenticate(
        &self,
        credentials: &Document,
    ) -> Result<Option<Arc<dyn User>>, LogBusError> {
        if !self.enabled {
            return Ok(Some(Arc::new(AnonymousUser)));
        }

        let username = credentials
            .get_str(CRED_USERNAME)
            .ok_or(LogBusError::AuthenticationFailed)?;
        let password = credentials
            .get_str(CRED_PASSWORD)
            .ok_or(LogBusError::AuthenticationFailed)?;

        let Some(entry) = self.lookup(username) else {
            // Delay on failure to mitigate timing attacks, as for a bad password.
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Err(LogBusError::AuthenticationFailed);
        };

        let parsed_hash = PasswordHash::new(&entry.password_hash)
            .map_err(|e| LogBusError::Internal(format!("malformed password hash: {e}")))?;
        if Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_err()
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Err(LogBusError::AuthenticationFailed);
        }

        let permissions = entry.permissions.iter().map(|p| WildMatch::new(p)).collect();
        Ok(Some(Arc::new(StaticUser {
            username: entry.username.clone(),
            permissions,
        })))
    }
}

/// Builds the credential document the thin client sends in `connect` frames.
pub(crate) fn credentials(username: &str, password: &str) -> Document {
    let mut doc = Document::new();
    doc.insert(CRED_USERNAME.into(), username.into());
    doc.insert(CRED_PASSWORD.into(), password.into());
    doc
}
