//! Transport trait and event types

pub mod tcp;
pub mod udp;

use std::net::SocketAddr;

use sipkit_core::Message;

use crate::error::Result;

/// Events emitted by a transport as traffic arrives
#[derive(Debug)]
pub enum TransportEvent {
    /// A SIP message was received and parsed
    MessageReceived {
        message: Message,
        source: SocketAddr,
        destination: SocketAddr,
    },
    /// Inbound bytes could not be parsed, or the socket reported an error.
    /// Reported for observability; the transport keeps running.
    Error { error: String },
    /// The transport has shut down; no further events will arrive
    Closed,
}

/// A SIP message transport
///
/// Implementations deliver inbound messages through the event channel handed
/// out at construction. Sends may be issued from any task; failures surface
/// as [`crate::Error`], they never crash the process.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Local address the transport is bound to
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Serialize and send a message to `destination`
    async fn send_message(&self, message: Message, destination: SocketAddr) -> Result<()>;

    /// Close the transport; subsequent sends fail with `TransportClosed`
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}
