//! Error types for the transport layer

use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the transport layer
#[derive(Debug, Error)]
pub enum Error {
    /// Binding or connecting a socket failed
    #[error("failed to bind/connect {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    /// Sending a message failed (unreachable host, closed socket, ...)
    #[error("failed to send to {destination}: {source}")]
    SendFailed {
        destination: std::net::SocketAddr,
        source: std::io::Error,
    },

    /// The transport has been closed
    #[error("transport closed")]
    TransportClosed,

    /// Socket-level I/O error outside of send
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
