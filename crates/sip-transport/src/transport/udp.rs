//! UDP transport for SIP messages
//!
//! Each datagram carries exactly one message. A single socket is shared by
//! the sender half and a spawned receive loop that parses packets and
//! forwards them as events.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use sipkit_core::Message;

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportEvent};

// Default channel capacity
const DEFAULT_CHANNEL_CAPACITY: usize = 100;

// Large enough for any sane signaling packet
const MAX_DATAGRAM: usize = 65_535;

/// UDP transport for SIP messages
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpTransportInner>,
}

struct UdpTransportInner {
    socket: Arc<UdpSocket>,
    closed: AtomicBool,
    /// Wakes the receive loop out of `recv_from` on close
    shutdown: Notify,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl UdpTransport {
    /// Creates a new UDP transport bound to the specified address
    pub async fn bind(
        addr: SocketAddr,
        channel_capacity: Option<usize>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let capacity = channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(capacity);

        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;
        info!("SIP UDP transport bound to {}", local_addr);

        let transport = UdpTransport {
            inner: Arc::new(UdpTransportInner {
                socket: Arc::new(socket),
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
                events_tx,
            }),
        };

        transport.spawn_receive_loop(local_addr);

        Ok((transport, events_rx))
    }

    // Spawns a task to receive packets from the UDP socket
    fn spawn_receive_loop(&self, local_addr: SocketAddr) {
        let transport = self.clone();

        tokio::spawn(async move {
            let inner = &transport.inner;
            let mut buf = vec![0u8; MAX_DATAGRAM];

            while !inner.closed.load(Ordering::Relaxed) {
                let received = tokio::select! {
                    _ = inner.shutdown.notified() => break,
                    received = inner.socket.recv_from(&mut buf) => received,
                };
                match received {
                    Ok((len, src)) => {
                        debug!("Received {} bytes from {}", len, src);

                        match sipkit_core::parse_message(&buf[..len]) {
                            Ok(message) => {
                                let event = TransportEvent::MessageReceived {
                                    message,
                                    source: src,
                                    destination: local_addr,
                                };
                                if inner.events_tx.send(event).await.is_err() {
                                    // receiver dropped; nothing left to do
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("Error parsing SIP message from {}: {}", src, e);
                                let _ = inner
                                    .events_tx
                                    .send(TransportEvent::Error {
                                        error: format!("Error parsing SIP message: {}", e),
                                    })
                                    .await;
                            }
                        }
                    }
                    Err(e) => {
                        if inner.closed.load(Ordering::Relaxed) {
                            break;
                        }
                        error!("Error receiving UDP packet: {}", e);
                        let _ = inner
                            .events_tx
                            .send(TransportEvent::Error {
                                error: format!("Error receiving packet: {}", e),
                            })
                            .await;
                    }
                }
            }

            let _ = inner.events_tx.send(TransportEvent::Closed).await;
            info!("UDP receive loop terminated");
        });
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    async fn send_message(&self, message: Message, destination: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }

        let bytes = message.to_bytes();
        debug!("Sending {} ({} bytes) to {}", message.summary(), bytes.len(), destination);

        self.inner
            .socket
            .send_to(&bytes, destination)
            .await
            .map_err(|source| Error::SendFailed {
                destination,
                source,
            })?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Relaxed);
        // notify_one stores a permit, so the loop wakes even if it is not
        // parked in recv_from yet
        self.inner.shutdown.notify_one();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.socket.local_addr() {
            Ok(addr) => write!(f, "UdpTransport({})", addr),
            Err(_) => write!(f, "UdpTransport(<unbound>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipkit_core::{Method, RequestBuilder};
    use std::time::Duration;

    #[tokio::test]
    async fn test_udp_loopback_send_receive() {
        let (a, _a_rx) = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let (b, mut b_rx) = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let b_addr = b.local_addr().unwrap();

        let request = RequestBuilder::new(Method::Options, "sip:b@example.com".parse().unwrap())
            .via("127.0.0.1:5060", "z9hG4bKudp")
            .from(None, &"sip:a@example.com".parse().unwrap(), Some("t"))
            .to(None, &"sip:b@example.com".parse().unwrap(), None)
            .call_id("udp-test")
            .cseq(1)
            .build();

        a.send_message(request.into(), b_addr).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), b_rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        match event {
            TransportEvent::MessageReceived { message, .. } => {
                assert_eq!(message.headers().call_id(), Some("udp-test"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_garbage_datagram_becomes_error_event() {
        let (t, mut rx) = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let addr = t.local_addr().unwrap();

        let plain = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        plain.send_to(b"this is not sip\r\n\r\n", addr).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert!(matches!(event, TransportEvent::Error { .. }));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (t, _rx) = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        t.close().await.unwrap();
        let request = RequestBuilder::new(Method::Options, "sip:x@y.z".parse().unwrap())
            .call_id("c")
            .cseq(1)
            .build();
        let result = t
            .send_message(request.into(), "127.0.0.1:5060".parse().unwrap())
            .await;
        assert!(matches!(result, Err(Error::TransportClosed)));
    }

    #[tokio::test]
    async fn test_close_wakes_the_receive_loop() {
        let (t, mut rx) = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        t.close().await.unwrap();

        // the loop must exit and report Closed without any inbound packet
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("receive loop did not wake on close")
            .expect("channel closed");
        assert!(matches!(event, TransportEvent::Closed));
    }
}
