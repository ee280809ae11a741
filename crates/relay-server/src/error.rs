//! Error types for the relay server.

use relay_proto::CodecError;

/// Errors that can occur in the relay
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Malformed or incomplete frame
    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    /// First frame did not identify a valid role
    #[error("Registration rejected: {0}")]
    Registration(String),

    /// Command addressed to an identity that is not connected
    #[error("Target {0} is not online")]
    TargetNotFound(String),

    /// Send or receive failure on one peer
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// File watcher error
    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),
}

impl RelayError {
    /// Whether this error ends the connection it occurred on.
    ///
    /// `TargetNotFound` is reported back to the issuing session, which stays
    /// open. Config and watcher errors never belong to a connection.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::Protocol(_)
                | RelayError::Registration(_)
                | RelayError::Transport(_)
                | RelayError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
