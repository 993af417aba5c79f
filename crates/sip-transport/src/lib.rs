//! SIP transport layer for the sipkit stack
//!
//! This crate moves SIP messages over the network: UDP (the default, one
//! message per datagram) and TCP (stream mode, messages delimited by
//! Content-Length). Inbound traffic is parsed and delivered as
//! [`TransportEvent`]s on an mpsc channel; parse failures become error
//! events, never panics.

pub mod error;
pub mod transport;

pub use error::{Error, Result};
pub use transport::{Transport, TransportEvent};
pub use transport::tcp::TcpTransport;
pub use transport::udp::UdpTransport;

/// Bind a UDP transport to the specified address
pub async fn bind_udp(
    addr: std::net::SocketAddr,
) -> Result<(UdpTransport, tokio::sync::mpsc::Receiver<TransportEvent>)> {
    UdpTransport::bind(addr, None).await
}

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{bind_udp, Error, Result, TcpTransport, Transport, TransportEvent, UdpTransport};
}
