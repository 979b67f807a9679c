// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of failure tags used to classify errors for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An operation or call deadline elapsed.
    Timeout,
    /// The remote side could not be reached or dropped the connection.
    Connection,
    /// Local I/O failure.
    Io,
    /// The remote side reported itself unavailable.
    Unavailable,
    /// A failure the caller knows to be short-lived.
    Transient,
    /// The requested entity does not exist.
    NotFound,
    /// The input was rejected.
    InvalidInput,
    /// The response could not be interpreted.
    DataIntegrity,
    /// Misconfiguration.
    Config,
    /// A circuit breaker short-circuited the call.
    CircuitOpen,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::Io => "io",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Transient => "transient",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::DataIntegrity => "data_integrity",
            ErrorKind::Config => "config",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ResilienceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Circuit breaker '{name}' is open after {consecutive_failures} consecutive failures")]
    CircuitOpen {
        name: String,
        consecutive_failures: u64,
        last_failure_time: Option<SystemTime>,
    },

    #[error("Call through '{name}' timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation failed ({kind}): {message}")]
    Operation { kind: ErrorKind, message: String },
}

impl ResilienceError {
    /// Build an operation error tagged with `kind`.
    pub fn operation(kind: ErrorKind, message: impl Into<String>) -> Self {
        ResilienceError::Operation {
            kind,
            message: message.into(),
        }
    }

    /// The classification tag of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResilienceError::Config(_) => ErrorKind::Config,
            ResilienceError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ResilienceError::Timeout { .. } => ErrorKind::Timeout,
            ResilienceError::Connection(_) => ErrorKind::Connection,
            ResilienceError::Io(_) => ErrorKind::Io,
            ResilienceError::InvalidInput(_) => ErrorKind::InvalidInput,
            ResilienceError::NotFound(_) => ErrorKind::NotFound,
            ResilienceError::Operation { kind, .. } => *kind,
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }
}

pub type Result<T> = std::result::Result<T, ResilienceError>;
