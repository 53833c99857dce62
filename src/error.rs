//! Error types for flowgate

use std::io;

use thiserror::Error;

use crate::rpc::Status;

/// Result type alias for flowgate
pub type Result<T> = std::result::Result<T, Error>;

/// flowgate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS material or handshake error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Transport error (broken connection, handshake rejected by the peer)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed frame or unexpected message on the wire
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A call completed with a non-OK status
    #[error("{0}")]
    Status(Status),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The call status carried by this error, if it is one.
    #[must_use]
    pub fn status(&self) -> Option<&Status> {
        match self {
            Self::Status(status) => Some(status),
            _ => None,
        }
    }

    /// `true` when the failure happened below the RPC layer (no status was
    /// ever received).
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Tls(_) | Self::Io(_))
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Self::Status(status)
    }
}
