// src/config.rs

//! Manages server configuration: loading, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;

/// A user entry in the static auth section.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthUser {
    /// The username presented in the `connect` credential document.
    pub username: String,
    /// The Argon2 password hash (PHC string).
    pub password_hash: String,
    /// Wildcard patterns over operation names this user may perform,
    /// e.g. `"publish"`, `"list_*"`, `"*"`.
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// The static authentication/authorization section.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AuthConfig {
    /// When false, every connection authenticates as an anonymous user that
    /// is allowed every operation.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub users: Vec<AuthUser>,
}

/// The top-level server configuration, loaded from a TOML file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-subscription and per-query ceiling on delivered-but-unacknowledged
    /// bytes. Delivery pauses at the ceiling and resumes on acknowledgment.
    #[serde(default = "default_max_unacked_bytes")]
    pub max_unacked_bytes: u64,
    /// Channels created at startup.
    #[serde(default)]
    pub channels: Vec<String>,
    /// Binders created at startup.
    #[serde(default)]
    pub binders: Vec<String>,
    #[serde(default)]
    pub auth: AuthConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7451
}
fn default_max_unacked_bytes() -> u64 {
    10 * 1024 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_unacked_bytes: default_max_unacked_bytes(),
            channels: Vec::new(),
            binders: Vec::new(),
            auth: AuthConfig::default(),
        }
    }
}

impl Config {
    /// Loads and validates a configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_unacked_bytes == 0 {
            return Err(anyhow!("max_unacked_bytes must be greater than zero"));
        }
        if self.auth.enabled && self.auth.users.is_empty() {
            return Err(anyhow!("auth is enabled but no users are configured"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn minimal_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 9000\nchannels = [\"orders\"]").unwrap();
        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.max_unacked_bytes, 10 * 1024 * 1024);
        assert_eq!(config.channels, vec!["orders".to_string()]);
        assert!(!config.auth.enabled);
    }

    #[test]
    fn auth_enabled_without_users_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[auth]\nenabled = true").unwrap();
        assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
    }
}
