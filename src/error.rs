//! Error types for the relay.

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during relay operations.
///
/// The type is `Clone` so terminal lifecycle signals (`once_connected`,
/// `once_ready`, ...) can hand the same failure to every waiter; I/O errors
/// are captured as their display string for that reason.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Network I/O error
    #[error("i/o error: {0}")]
    Io(String),

    /// Invalid message format (SOCKS records, JSON handshake frames)
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Peer or SOCKS protocol violation
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Peer transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// API misuse (calling a once-only operation twice, ...)
    #[error("misuse: {0}")]
    Misuse(&'static str),

    /// The connection is closed or was never established
    #[error("connection closed")]
    ConnectionClosed,

    /// A permanent handler is already installed on the queue
    #[error("a handler is already installed")]
    HandlerInstalled,

    /// A queued item was dropped before any handler consumed it
    #[error("queued item dropped before handling")]
    QueueCleared,
}

impl Error {
    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new invalid-message error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidMessage(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidMessage(e.to_string())
    }
}
