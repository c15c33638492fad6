//! Error taxonomy for the connection manager.

use thiserror::Error;

use crate::endpoint::ConnectionId;

pub type Result<T> = std::result::Result<T, ConnectorError>;

#[derive(Debug, Error)]
pub enum ConnectorError {
    /// TCP socket failure during connect or handshake.
    #[error("network error {code}: {message}")]
    Network { code: i32, message: String },

    /// Handshake record malformed, truncated, or incompatible.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// The id does not name a live endpoint.
    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    /// Transient: the server is at its connection ceiling.
    #[error("server at capacity ({0} connections)")]
    AtCapacity(usize),

    #[error("server already running")]
    AlreadyRunning,

    /// Failure from the queue-pair engine during establishment.
    #[error(transparent)]
    Device(#[from] devx::DevxError),
}

/// Wrap a socket error, preserving the OS error code for callers that
/// match on ETIMEDOUT/ECONNREFUSED.
pub(crate) fn net_err(e: std::io::Error, ctx: &str) -> ConnectorError {
    let code = e.raw_os_error().unwrap_or(match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => libc::ETIMEDOUT,
        _ => 0,
    });
    ConnectorError::Network {
        code,
        message: format!("{}: {}", ctx, e),
    }
}
