//! TCP transport for SIP messages (stream mode)
//!
//! A TCP stream has no message boundaries, so framing follows the SIP rule:
//! a message ends at the blank line after its headers plus Content-Length
//! bytes of body. The framer buffers until a complete message is available
//! and handles pipelined messages and messages split across reads.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use sipkit_core::Message;

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportEvent};

const DEFAULT_CHANNEL_CAPACITY: usize = 100;
const READ_CHUNK: usize = 8192;

// Refuse to buffer unbounded garbage from a peer that never completes a
// message.
const MAX_PENDING: usize = 1024 * 1024;

/// TCP transport connected to a single peer
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpTransportInner>,
}

struct TcpTransportInner {
    writer: Mutex<OwnedWriteHalf>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    closed: AtomicBool,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl TcpTransport {
    /// Connect to a peer and start the framing read loop
    pub async fn connect(
        peer: SocketAddr,
        channel_capacity: Option<usize>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let capacity = channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(capacity);

        let stream = TcpStream::connect(peer)
            .await
            .map_err(|source| Error::Bind { addr: peer, source })?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        info!("SIP TCP transport connected {} -> {}", local_addr, peer_addr);

        let (read_half, write_half) = stream.into_split();

        let transport = TcpTransport {
            inner: Arc::new(TcpTransportInner {
                writer: Mutex::new(write_half),
                local_addr,
                peer_addr,
                closed: AtomicBool::new(false),
                events_tx,
            }),
        };

        transport.spawn_read_loop(read_half);

        Ok((transport, events_rx))
    }

    fn spawn_read_loop(&self, mut read_half: tokio::net::tcp::OwnedReadHalf) {
        let transport = self.clone();

        tokio::spawn(async move {
            let inner = &transport.inner;
            let mut pending = BytesMut::new();
            let mut chunk = vec![0u8; READ_CHUNK];

            'outer: while !inner.closed.load(Ordering::Relaxed) {
                let n = match read_half.read(&mut chunk).await {
                    Ok(0) => break, // peer closed
                    Ok(n) => n,
                    Err(e) => {
                        if !inner.closed.load(Ordering::Relaxed) {
                            let _ = inner
                                .events_tx
                                .send(TransportEvent::Error {
                                    error: format!("Error reading stream: {}", e),
                                })
                                .await;
                        }
                        break;
                    }
                };
                pending.extend_from_slice(&chunk[..n]);

                loop {
                    match extract_frame(&mut pending) {
                        Ok(Some(frame)) => {
                            match sipkit_core::parse_message(&frame) {
                                Ok(message) => {
                                    let event = TransportEvent::MessageReceived {
                                        message,
                                        source: inner.peer_addr,
                                        destination: inner.local_addr,
                                    };
                                    if inner.events_tx.send(event).await.is_err() {
                                        break 'outer;
                                    }
                                }
                                Err(e) => {
                                    warn!("Error parsing framed SIP message: {}", e);
                                    let _ = inner
                                        .events_tx
                                        .send(TransportEvent::Error {
                                            error: format!("Error parsing SIP message: {}", e),
                                        })
                                        .await;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            // Framing is unrecoverable on a byte stream: the
                            // message boundary is lost, so drop the
                            // connection.
                            let _ = inner
                                .events_tx
                                .send(TransportEvent::Error {
                                    error: format!("Stream framing error: {}", e),
                                })
                                .await;
                            break 'outer;
                        }
                    }
                }

                if pending.len() > MAX_PENDING {
                    let _ = inner
                        .events_tx
                        .send(TransportEvent::Error {
                            error: "stream buffer overflow without complete message".to_string(),
                        })
                        .await;
                    break;
                }
            }

            inner.closed.store(true, Ordering::Relaxed);
            let _ = inner.events_tx.send(TransportEvent::Closed).await;
            info!("TCP read loop terminated");
        });
    }
}

/// Pull one complete SIP message off the front of `pending`, if present.
///
/// Returns `Ok(None)` when more bytes are needed, and an error when the
/// buffered head cannot be a SIP message (no Content-Length ahead of a
/// body-bearing frame is indistinguishable from garbage in stream mode).
fn extract_frame(pending: &mut BytesMut) -> std::result::Result<Option<Vec<u8>>, String> {
    let (head_len, sep_len) = match find_separator(pending) {
        Some(found) => found,
        None => return Ok(None),
    };

    let head = String::from_utf8_lossy(&pending[..head_len]);
    let body_len = match content_length_of(&head) {
        Some(len) => len,
        // Stream framing requires an explicit length; a frame with no
        // Content-Length header is taken as a zero-length body so that
        // keep-alive style traffic does not stall the connection.
        None => 0,
    };

    let total = head_len + sep_len + body_len;
    if pending.len() < total {
        return Ok(None);
    }

    let frame = pending.split_to(total).to_vec();
    debug!("Framed {} byte message from stream", frame.len());
    Ok(Some(frame))
}

/// Locate the header/body separator, tolerating bare LF
fn find_separator(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = buf.windows(2).position(|w| w == b"\n\n");
    match (crlf, lf) {
        (Some(c), Some(l)) if l + 2 < c => Some((l, 2)),
        (Some(c), _) => Some((c, 4)),
        (None, Some(l)) => Some((l, 2)),
        (None, None) => None,
    }
}

/// Scan header text for Content-Length (or its compact form `l`)
fn content_length_of(head: &str) -> Option<usize> {
    for line in head.lines().skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            return value.trim().parse().ok();
        }
    }
    None
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr)
    }

    async fn send_message(&self, message: Message, destination: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        if destination != self.inner.peer_addr {
            debug!(
                "TCP transport connected to {}, ignoring requested destination {}",
                self.inner.peer_addr, destination
            );
        }

        let bytes = message.to_bytes();
        let mut writer = self.inner.writer.lock().await;
        writer
            .write_all(&bytes)
            .await
            .map_err(|source| Error::SendFailed {
                destination: self.inner.peer_addr,
                source,
            })?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Relaxed);
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TcpTransport({} -> {})",
            self.inner.local_addr, self.inner.peer_addr
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(body: &str) -> String {
        format!(
            "OPTIONS sip:a@b.c SIP/2.0\r\nCall-ID: f\r\nCSeq: 1 OPTIONS\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
    }

    #[test]
    fn test_extract_single_frame() {
        let mut buf = BytesMut::from(msg("hello").as_bytes());
        let frame = extract_frame(&mut buf).unwrap().unwrap();
        assert!(frame.ends_with(b"hello"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_extract_pipelined_frames() {
        let mut buf = BytesMut::from(format!("{}{}", msg("one"), msg("two!")).as_bytes());
        let first = extract_frame(&mut buf).unwrap().unwrap();
        let second = extract_frame(&mut buf).unwrap().unwrap();
        assert!(first.ends_with(b"one"));
        assert!(second.ends_with(b"two!"));
        assert!(buf.is_empty());
        assert_eq!(extract_frame(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_incomplete_frame_waits_for_more() {
        let full = msg("split body");
        let mut buf = BytesMut::from(&full.as_bytes()[..full.len() - 4]);
        assert_eq!(extract_frame(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full.as_bytes()[full.len() - 4..]);
        assert!(extract_frame(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_headers_only_no_separator_yet() {
        let mut buf = BytesMut::from(&b"OPTIONS sip:a@b.c SIP/2.0\r\nCall-ID: x\r\n"[..]);
        assert_eq!(extract_frame(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_missing_content_length_framed_as_empty_body() {
        let mut buf =
            BytesMut::from(&b"OPTIONS sip:a@b.c SIP/2.0\r\nCall-ID: x\r\n\r\nleftover"[..]);
        let frame = extract_frame(&mut buf).unwrap().unwrap();
        assert!(frame.ends_with(b"\r\n\r\n"));
        assert_eq!(&buf[..], b"leftover");
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        use sipkit_core::{Method, RequestBuilder};
        use std::time::Duration;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            // Read until the client's zero-body frame is complete
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            buf
        });

        let (client, _rx) = TcpTransport::connect(server_addr, None).await.unwrap();
        let request = RequestBuilder::new(Method::Options, "sip:s@example.com".parse().unwrap())
            .via("127.0.0.1:5060", "z9hG4bKtcp")
            .call_id("tcp-test")
            .cseq(1)
            .build();
        client.send_message(request.into(), server_addr).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        let text = String::from_utf8(received).unwrap();
        assert!(text.starts_with("OPTIONS sip:s@example.com SIP/2.0\r\n"));
        assert!(text.contains("Call-ID: tcp-test\r\n"));
    }
}
