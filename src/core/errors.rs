// src/core/errors.rs

//! Defines the primary error type for the entire application.

use crate::core::protocol::ErrCode;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the server.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum LogBusError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Authorisation failed")]
    AuthorizationFailed,

    #[error("User is not authorised")]
    NotAuthorized,

    #[error("No such channel '{0}'")]
    NoSuchChannel(String),

    #[error("No such binder '{0}'")]
    NoSuchBinder(String),

    #[error("No such query '{0}'")]
    NoSuchQuery(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Subscription id space exhausted")]
    SubIdExhausted,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl LogBusError {
    /// Maps an error to the numeric code carried in error response frames,
    /// if it corresponds to one of the wire-level error codes.
    pub fn code(&self) -> Option<ErrCode> {
        match self {
            LogBusError::AuthenticationFailed => Some(ErrCode::AuthenticationFailed),
            LogBusError::AuthorizationFailed => Some(ErrCode::AuthorizationFailed),
            LogBusError::NotAuthorized => Some(ErrCode::NotAuthorized),
            LogBusError::NoSuchChannel(_) => Some(ErrCode::NoSuchChannel),
            LogBusError::NoSuchBinder(_) => Some(ErrCode::NoSuchBinder),
            LogBusError::NoSuchQuery(_) => Some(ErrCode::NoSuchQuery),
            LogBusError::ServerError(_) | LogBusError::Internal(_) => Some(ErrCode::ServerError),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LogBusError {
    fn from(err: std::io::Error) -> Self {
        LogBusError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for LogBusError {
    fn from(err: serde_json::Error) -> Self {
        LogBusError::ProtocolError(err.to_string())
    }
}
