//! Error types for the shared store layer

use std::fmt;
use thiserror::Error;

use crate::error::ErrorCode;

/// Result type for shared store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared store error types
#[derive(Error, Debug)]
pub enum StoreError {
    /// Store could not be reached (connection refused, pool exhausted, ...)
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Connection established but the command failed
    #[error("Store command failed: {0}")]
    Command(String),

    /// Atomic script returned something we cannot interpret
    #[error("Store script error: {0}")]
    Script(String),

    /// A stored value could not be decoded
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Timeout occurred
    #[error("Timeout: operation took longer than {0:?}")]
    Timeout(std::time::Duration),
}

impl StoreError {
    /// Create an unavailable error
    pub fn unavailable<E: fmt::Display>(msg: E) -> Self {
        Self::Unavailable(msg.to_string())
    }

    /// Create a command error
    pub fn command<E: fmt::Display>(msg: E) -> Self {
        Self::Command(msg.to_string())
    }

    /// Create a script error
    pub fn script<E: fmt::Display>(msg: E) -> Self {
        Self::Script(msg.to_string())
    }

    /// Create a deserialization error
    pub fn deserialization<E: fmt::Display>(err: E) -> Self {
        Self::Deserialization(err.to_string())
    }

    /// Create a configuration error
    pub fn configuration<E: fmt::Display>(msg: E) -> Self {
        Self::Configuration(msg.to_string())
    }

    /// Whether the store itself is unreachable, as opposed to a bad command
    ///
    /// The admission controller degrades only on this class of failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }

    pub fn code(&self) -> u16 {
        match self {
            Self::Unavailable(_) => ErrorCode::STORE_UNAVAILABLE,
            Self::Command(_) => ErrorCode::STORE_GENERIC,
            Self::Script(_) => ErrorCode::STORE_SCRIPT_FAILED,
            Self::Deserialization(_) => ErrorCode::STORE_DESERIALIZATION_ERROR,
            Self::Configuration(_) => ErrorCode::CONFIG_GENERIC,
            Self::Timeout(_) => ErrorCode::STORE_TEMPORARY,
        }
    }
}

#[cfg(feature = "redis")]
impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            Self::unavailable(err)
        } else {
            Self::command(err)
        }
    }
}
