//! Session coordinator: the single public entry point
//!
//! The coordinator owns one transport and one event-loop task. Every piece
//! of registration, transaction and dialog state lives inside that task;
//! this facade only posts [`Command`]s into it and awaits the oneshot reply,
//! so it is `Clone` and freely shareable across tasks without locking.

mod event_loop;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::info;

use sipkit_core::Uri;
use sipkit_transport::{Transport, TransportEvent};

use crate::dialog::{CallHandle, CallState};
use crate::error::{Error, Result};
use crate::events::UaEvent;
use crate::profile::{Profile, ProfileHandle};
use crate::registration::RegistrationState;

use event_loop::{Command, EventLoop};

/// Tunables for a coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long an outbound call may ring before it is cancelled as
    /// unanswered
    pub ring_timeout: Duration,
    /// Capacity of the [`UaEvent`] channel handed back from [`SessionCoordinator::start`]
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            ring_timeout: Duration::from_secs(30),
            event_capacity: 64,
        }
    }
}

/// Coordinates registrations and calls over one transport
#[derive(Debug, Clone)]
pub struct SessionCoordinator {
    commands: mpsc::Sender<Command>,
}

impl SessionCoordinator {
    /// Start a coordinator over `transport`, whose inbound traffic arrives
    /// on `transport_events`. Returns the coordinator handle and the stream
    /// of lifecycle events.
    pub fn start(
        transport: Arc<dyn Transport>,
        transport_events: mpsc::Receiver<TransportEvent>,
    ) -> Result<(Self, mpsc::Receiver<UaEvent>)> {
        Self::start_with_config(transport, transport_events, CoordinatorConfig::default())
    }

    pub fn start_with_config(
        transport: Arc<dyn Transport>,
        transport_events: mpsc::Receiver<TransportEvent>,
        config: CoordinatorConfig,
    ) -> Result<(Self, mpsc::Receiver<UaEvent>)> {
        let local_addr = transport.local_addr()?;
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity);

        let event_loop = EventLoop::new(
            transport,
            local_addr,
            transport_events,
            commands_rx,
            events_tx,
            config.ring_timeout,
        );
        tokio::spawn(event_loop.run());
        info!("session coordinator started on {}", local_addr);

        Ok((SessionCoordinator { commands: commands_tx }, events_rx))
    }

    /// Register a profile with the coordinator.
    ///
    /// Configuring the same identity (username and domain) twice returns the
    /// existing handle with the stored credentials updated; it never creates
    /// a duplicate registration.
    pub async fn configure_profile(&self, profile: Profile) -> Result<ProfileHandle> {
        profile.validate()?;
        self.request(|reply| Command::ConfigureProfile { profile, reply })
            .await
    }

    /// Begin (or redo) the REGISTER flow for a configured profile.
    /// Progress arrives as [`UaEvent::RegistrationStateChanged`].
    pub async fn start_registration(&self, profile: ProfileHandle) -> Result<()> {
        self.request(|reply| Command::StartRegistration { profile, reply })
            .await
    }

    /// Remove the binding at the registrar. Best effort: a single
    /// zero-Expires REGISTER is sent and the profile immediately becomes
    /// Unregistered.
    pub async fn unregister(&self, profile: ProfileHandle) -> Result<()> {
        self.request(|reply| Command::Unregister { profile, reply })
            .await
    }

    /// Place an outbound call from a registered profile to `target`.
    /// Fails with [`Error::NotRegistered`] before any traffic is sent if the
    /// profile has no active registration.
    pub async fn place_call(&self, profile: ProfileHandle, target: Uri) -> Result<CallHandle> {
        self.request(|reply| Command::PlaceCall {
            profile,
            target,
            ring_timeout: None,
            reply,
        })
        .await
    }

    /// Like [`place_call`](Self::place_call), with a per-call ring timeout
    /// overriding [`CoordinatorConfig::ring_timeout`]
    pub async fn place_call_with_ring_timeout(
        &self,
        profile: ProfileHandle,
        target: Uri,
        ring_timeout: Duration,
    ) -> Result<CallHandle> {
        self.request(|reply| Command::PlaceCall {
            profile,
            target,
            ring_timeout: Some(ring_timeout),
            reply,
        })
        .await
    }

    /// End a call. On an established call this sends BYE; on a still-ringing
    /// call it cancels instead.
    pub async fn hangup(&self, call: CallHandle) -> Result<()> {
        self.request(|reply| Command::Hangup { call, reply }).await
    }

    /// Abort an outbound call that has not been answered yet
    pub async fn cancel(&self, call: CallHandle) -> Result<()> {
        self.request(|reply| Command::Cancel { call, reply }).await
    }

    /// Current state of a call
    pub async fn call_state(&self, call: CallHandle) -> Result<CallState> {
        self.request(|reply| Command::CallState { call, reply }).await
    }

    /// Current registration state of a profile
    pub async fn registration_state(&self, profile: ProfileHandle) -> Result<RegistrationState> {
        self.request(|reply| Command::RegistrationState { profile, reply })
            .await
    }

    /// Stop the event loop and close the transport
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { reply })
            .await
            .map_err(|_| Error::ChannelClosed)?;
        done.await.map_err(|_| Error::ChannelClosed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| Error::ChannelClosed)?;
        response.await.map_err(|_| Error::ChannelClosed)?
    }
}
