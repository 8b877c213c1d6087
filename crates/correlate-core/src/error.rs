//! Error types for correlate-core

use std::time::Duration;
use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for correlate-core
///
/// Only argument and lifecycle problems surface here. Timeouts are delivered
/// through the entry's failure continuation as [`TimedOut`], and resolving or
/// cancelling an unknown key is never an error.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed delay, or a message without an identifier while the
    /// missing-id policy demands one.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The key already has a pending entry.
    #[error("Correlation key already pending: {key}")]
    DuplicateKey { key: String },

    /// `max_pending` entries are already registered.
    #[error("Correlation table full: {capacity} entries pending")]
    TableFull { capacity: usize },

    /// The table was torn down with `close()`.
    #[error("Correlation table is closed")]
    Closed,

    /// Timer service could not be created or used.
    #[error("Timer error: {0}")]
    Timer(String),

    /// Replay script errors
    #[error("Replay error: {0}")]
    Replay(String),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error was caused by the caller's arguments rather than
    /// table state.
    #[must_use]
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

/// Failure value handed to an entry's failure continuation when its timer
/// fires before a response arrives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TimedOut {
    /// Failure message configured at registration (or the table default).
    pub message: String,
    /// Delay the entry was registered with.
    pub delay: Duration,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
