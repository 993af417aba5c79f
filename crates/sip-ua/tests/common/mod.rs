//! Shared harness for the integration tests: a channel-backed transport so
//! every byte the user agent sends can be inspected, and canned responses
//! can be injected as if they came from the registrar.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use sipkit_core::{
    HeaderName, Message, Request, Response, ResponseBuilder, StatusCode,
};
use sipkit_transport::{Transport, TransportEvent};
use sipkit_ua::{
    CoordinatorConfig, Profile, ProfileHandle, RegistrationState, SessionCoordinator, UaEvent,
};

pub const LOCAL: &str = "10.0.0.1:5060";
pub const SERVER: &str = "198.51.100.10:5060";

/// Generous bound for awaiting something that should already be pending;
/// under a paused clock it only elapses when the expectation is wrong.
const WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug)]
struct MockTransport {
    local: SocketAddr,
    closed: AtomicBool,
    wire: mpsc::UnboundedSender<(Message, SocketAddr)>,
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    fn local_addr(&self) -> sipkit_transport::Result<SocketAddr> {
        Ok(self.local)
    }

    async fn send_message(
        &self,
        message: Message,
        destination: SocketAddr,
    ) -> sipkit_transport::Result<()> {
        self.wire
            .send((message, destination))
            .map_err(|_| sipkit_transport::Error::TransportClosed)
    }

    async fn close(&self) -> sipkit_transport::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct TestNet {
    pub ua: SessionCoordinator,
    pub events: mpsc::Receiver<UaEvent>,
    pub wire: mpsc::UnboundedReceiver<(Message, SocketAddr)>,
    pub inbound: mpsc::Sender<TransportEvent>,
}

pub fn start() -> TestNet {
    start_with(CoordinatorConfig::default())
}

pub fn start_with(config: CoordinatorConfig) -> TestNet {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("sipkit_ua=debug")
        .with_test_writer()
        .try_init();
    let (wire_tx, wire_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::channel(16);
    let transport = Arc::new(MockTransport {
        local: LOCAL.parse().unwrap(),
        closed: AtomicBool::new(false),
        wire: wire_tx,
    });
    let (ua, events) =
        SessionCoordinator::start_with_config(transport, inbound_rx, config).unwrap();
    TestNet {
        ua,
        events,
        wire: wire_rx,
        inbound: inbound_tx,
    }
}

impl TestNet {
    /// Next request the user agent put on the wire
    pub async fn sent_request(&mut self) -> Request {
        let (message, _) = tokio::time::timeout(WAIT, self.wire.recv())
            .await
            .expect("timed out waiting for an outbound request")
            .expect("transport channel closed");
        match message {
            Message::Request(request) => request,
            Message::Response(response) => {
                panic!("expected an outbound request, got {}", response.status)
            }
        }
    }

    /// Next response the user agent put on the wire
    pub async fn sent_response(&mut self) -> Response {
        let (message, _) = tokio::time::timeout(WAIT, self.wire.recv())
            .await
            .expect("timed out waiting for an outbound response")
            .expect("transport channel closed");
        match message {
            Message::Response(response) => response,
            Message::Request(request) => {
                panic!("expected an outbound response, got {}", request.method)
            }
        }
    }

    /// Read requests until one differs from `request`; retransmissions of
    /// the same transaction are identical byte for byte.
    pub async fn sent_request_skipping_retransmits(&mut self, of: &Request) -> Request {
        loop {
            let next = self.sent_request().await;
            if next.headers.via_branch() != of.headers.via_branch() || next.method != of.method {
                return next;
            }
        }
    }

    pub fn wire_is_quiet(&mut self) -> bool {
        self.wire.try_recv().is_err()
    }

    /// Deliver a response as if the server sent it
    pub async fn inject(&self, response: Response) {
        self.deliver(Message::Response(response)).await;
    }

    pub async fn inject_request(&self, request: Request) {
        self.deliver(Message::Request(request)).await;
    }

    async fn deliver(&self, message: Message) {
        self.inbound
            .send(TransportEvent::MessageReceived {
                message,
                source: SERVER.parse().unwrap(),
                destination: LOCAL.parse().unwrap(),
            })
            .await
            .expect("event loop has stopped");
    }

    pub async fn event(&mut self) -> UaEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    pub async fn expect_registration_state(&mut self) -> (ProfileHandle, RegistrationState) {
        match self.event().await {
            UaEvent::RegistrationStateChanged { profile, state, .. } => (profile, state),
            other => panic!("expected a registration event, got {:?}", other),
        }
    }

    /// Drive a profile through the unchallenged happy path to Registered
    pub async fn register(&mut self, profile: Profile) -> ProfileHandle {
        let handle = self.ua.configure_profile(profile).await.unwrap();
        self.ua.start_registration(handle).await.unwrap();
        assert_eq!(
            self.expect_registration_state().await,
            (handle, RegistrationState::Registering)
        );
        let register = self.sent_request().await;
        self.inject(ok_with_expires(&register, 3600)).await;
        assert_eq!(
            self.expect_registration_state().await,
            (handle, RegistrationState::Registered)
        );
        handle
    }
}

pub fn alice() -> Profile {
    Profile::new("alice", "sip.example.com", SERVER.parse().unwrap())
        .with_password("secret")
        .with_display_name("Alice")
}

pub fn ok_with_expires(register: &Request, expires: u32) -> Response {
    ResponseBuilder::response_to(register, StatusCode::Ok)
        .header(HeaderName::Expires, expires.to_string())
        .build()
}

pub fn challenge(register: &Request, nonce: &str) -> Response {
    ResponseBuilder::response_to(register, StatusCode::Unauthorized)
        .header(
            HeaderName::WwwAuthenticate,
            format!("Digest realm=\"sip.example.com\", nonce=\"{}\"", nonce),
        )
        .build()
}
