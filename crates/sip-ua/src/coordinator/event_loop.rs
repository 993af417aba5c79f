//! The coordinator's event loop
//!
//! One task owns every registration entry, client transaction and dialog.
//! It multiplexes three inbound streams with `select!`: commands from the
//! [`super::SessionCoordinator`] facade, traffic from the transport, and
//! timer ticks. Timers are spawned sleeps that post a [`TimerEvent`] back
//! into the loop; each tick carries the generation it was armed with, and a
//! tick whose generation no longer matches the current record is discarded.
//! That makes every timer cancellation race-free without shared locks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use sipkit_core::{
    DigestChallenge, HeaderName, Message, Method, Request, Response, ResponseBuilder, StatusCode,
    Uri,
};
use sipkit_transport::{Transport, TransportEvent};

use crate::dialog::{CallHandle, CallState, Dialog};
use crate::error::{Error, Result};
use crate::events::{EndReason, UaEvent};
use crate::profile::{Profile, ProfileHandle};
use crate::registration::{RegistrationEntry, RegistrationState};
use crate::transaction::{ClientTransaction, TransactionKey, TxOwner, TIMER_B};

/// Commands posted by the coordinator facade
#[derive(Debug)]
pub(crate) enum Command {
    ConfigureProfile {
        profile: Profile,
        reply: oneshot::Sender<Result<ProfileHandle>>,
    },
    StartRegistration {
        profile: ProfileHandle,
        reply: oneshot::Sender<Result<()>>,
    },
    Unregister {
        profile: ProfileHandle,
        reply: oneshot::Sender<Result<()>>,
    },
    PlaceCall {
        profile: ProfileHandle,
        target: Uri,
        ring_timeout: Option<Duration>,
        reply: oneshot::Sender<Result<CallHandle>>,
    },
    Hangup {
        call: CallHandle,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        call: CallHandle,
        reply: oneshot::Sender<Result<()>>,
    },
    CallState {
        call: CallHandle,
        reply: oneshot::Sender<Result<CallState>>,
    },
    RegistrationState {
        profile: ProfileHandle,
        reply: oneshot::Sender<Result<RegistrationState>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Timer ticks posted back into the loop by spawned sleeps
#[derive(Debug)]
enum TimerEvent {
    Retransmit {
        key: TransactionKey,
        generation: u64,
    },
    RegistrationRefresh {
        profile: ProfileHandle,
        generation: u64,
    },
    RingTimeout {
        call: CallHandle,
        generation: u64,
    },
    DialogSweep {
        call: CallHandle,
        generation: u64,
    },
}

/// How long a closed dialog lingers to absorb retransmitted requests
/// before the sweep timer drops it (64*T1)
const DIALOG_LINGER: Duration = Duration::from_secs(32);

pub(crate) struct EventLoop {
    transport: Arc<dyn Transport>,
    local_addr: SocketAddr,
    transport_events: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Receiver<Command>,
    timers_tx: mpsc::Sender<TimerEvent>,
    timers_rx: mpsc::Receiver<TimerEvent>,
    events: mpsc::Sender<UaEvent>,
    profiles: HashMap<ProfileHandle, RegistrationEntry>,
    dialogs: HashMap<CallHandle, Dialog>,
    transactions: HashMap<TransactionKey, ClientTransaction>,
    /// Monotonic counter stamped onto timer-bearing records
    generation: u64,
    ring_timeout: Duration,
}

impl EventLoop {
    pub fn new(
        transport: Arc<dyn Transport>,
        local_addr: SocketAddr,
        transport_events: mpsc::Receiver<TransportEvent>,
        commands: mpsc::Receiver<Command>,
        events: mpsc::Sender<UaEvent>,
        ring_timeout: Duration,
    ) -> Self {
        let (timers_tx, timers_rx) = mpsc::channel(64);
        EventLoop {
            transport,
            local_addr,
            transport_events,
            commands,
            timers_tx,
            timers_rx,
            events,
            profiles: HashMap::new(),
            dialogs: HashMap::new(),
            transactions: HashMap::new(),
            generation: 0,
            ring_timeout,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                event = self.transport_events.recv() => match event {
                    Some(TransportEvent::MessageReceived { message, source, .. }) => {
                        self.handle_message(message, source).await;
                    }
                    Some(TransportEvent::Error { error }) => {
                        warn!("transport reported: {}", error);
                    }
                    Some(TransportEvent::Closed) | None => {
                        info!("transport closed, stopping event loop");
                        break;
                    }
                },
                Some(timer) = self.timers_rx.recv() => {
                    self.handle_timer(timer).await;
                }
            }
        }
        if !self.transport.is_closed() {
            if let Err(error) = self.transport.close().await {
                debug!("transport close on shutdown: {}", error);
            }
        }
    }

    // ---- commands ----------------------------------------------------

    /// Returns true when the loop should stop
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::ConfigureProfile { profile, reply } => {
                let _ = reply.send(Ok(self.configure_profile(profile)));
            }
            Command::StartRegistration { profile, reply } => {
                let result = self.start_registration(profile).await;
                let _ = reply.send(result);
            }
            Command::Unregister { profile, reply } => {
                let result = self.unregister(profile).await;
                let _ = reply.send(result);
            }
            Command::PlaceCall {
                profile,
                target,
                ring_timeout,
                reply,
            } => {
                let result = self.place_call(profile, target, ring_timeout).await;
                let _ = reply.send(result);
            }
            Command::Hangup { call, reply } => {
                let result = self.hangup(call).await;
                let _ = reply.send(result);
            }
            Command::Cancel { call, reply } => {
                let result = self.cancel_call(call).await;
                let _ = reply.send(result);
            }
            Command::CallState { call, reply } => {
                let result = self
                    .dialogs
                    .get(&call)
                    .map(|dialog| dialog.state)
                    .ok_or(Error::UnknownHandle);
                let _ = reply.send(result);
            }
            Command::RegistrationState { profile, reply } => {
                let result = self
                    .profiles
                    .get(&profile)
                    .map(|entry| entry.state)
                    .ok_or(Error::UnknownHandle);
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn configure_profile(&mut self, profile: Profile) -> ProfileHandle {
        // Same identity twice updates credentials in place instead of
        // creating a second registration.
        if let Some((handle, entry)) = self
            .profiles
            .iter_mut()
            .find(|(_, entry)| entry.profile.same_identity(&profile))
        {
            debug!("profile {} reconfigured", handle);
            entry.profile = profile;
            return *handle;
        }
        let handle = ProfileHandle::new();
        info!("profile {} configured for {}", handle, profile.aor());
        self.profiles.insert(handle, RegistrationEntry::new(profile));
        handle
    }

    async fn start_registration(&mut self, profile: ProfileHandle) -> Result<()> {
        let local_addr = self.local_addr;
        // a previous attempt still in flight must not fail the new one
        self.drop_registration_transactions(profile);
        let entry = self.profiles.get_mut(&profile).ok_or(Error::UnknownHandle)?;

        entry.begin_attempt();
        let was = entry.state;
        entry.state = RegistrationState::Registering;
        let contact = contact_uri(&entry.profile.username, local_addr);
        let expires = entry.requested_expires;
        let request = entry.build_register(&contact, expires, None);
        let destination = entry.profile.server;

        if was != RegistrationState::Registering {
            self.emit(UaEvent::RegistrationStateChanged {
                profile,
                state: RegistrationState::Registering,
                reason: None,
            })
            .await;
        }
        self.send_and_track(request, destination, TxOwner::Registration(profile))
            .await;
        Ok(())
    }

    /// A single zero-Expires REGISTER, fire and forget; the profile is
    /// Unregistered immediately regardless of what the registrar answers.
    async fn unregister(&mut self, profile: ProfileHandle) -> Result<()> {
        let local_addr = self.local_addr;
        let stale = self.next_generation();
        self.drop_registration_transactions(profile);
        let entry = self.profiles.get_mut(&profile).ok_or(Error::UnknownHandle)?;

        entry.begin_attempt();
        entry.refresh_generation = stale;
        let was = entry.state;
        entry.state = RegistrationState::Unregistered;
        entry.granted_expires = None;
        let contact = contact_uri(&entry.profile.username, local_addr);
        let request = entry.build_register(&contact, 0, None);
        let destination = entry.profile.server;

        self.send(Message::Request(request), destination).await;
        if was != RegistrationState::Unregistered {
            self.emit(UaEvent::RegistrationStateChanged {
                profile,
                state: RegistrationState::Unregistered,
                reason: None,
            })
            .await;
        }
        Ok(())
    }

    async fn place_call(
        &mut self,
        profile: ProfileHandle,
        target: Uri,
        ring_timeout: Option<Duration>,
    ) -> Result<CallHandle> {
        let sent_by = self.local_addr.to_string();
        let ring_generation = self.next_generation();
        let entry = self.profiles.get(&profile).ok_or(Error::UnknownHandle)?;
        if entry.state != RegistrationState::Registered {
            return Err(Error::NotRegistered);
        }

        let contact = contact_uri(&entry.profile.username, self.local_addr);
        let display = entry.profile.display_name.clone();
        let destination = entry.profile.server;

        let mut dialog = Dialog::new_outbound(entry.profile.aor(), target, destination);
        let invite = dialog.build_invite(display.as_deref(), &contact, &sent_by);
        dialog.ring_generation = ring_generation;
        let call = dialog.handle;
        info!("{} placing call to {}", call, dialog.remote_uri);
        self.dialogs.insert(call, dialog);

        self.send_and_track(invite, destination, TxOwner::Call(call))
            .await;
        self.arm_timer(
            ring_timeout.unwrap_or(self.ring_timeout),
            TimerEvent::RingTimeout {
                call,
                generation: ring_generation,
            },
        );
        Ok(call)
    }

    async fn hangup(&mut self, call: CallHandle) -> Result<()> {
        let sent_by = self.local_addr.to_string();
        let state = self
            .dialogs
            .get(&call)
            .map(|dialog| dialog.state)
            .ok_or(Error::UnknownHandle)?;

        match state {
            CallState::Calling | CallState::Ringing => self.cancel_call(call).await,
            CallState::Established => {
                let dialog = self.dialogs.get_mut(&call).ok_or(Error::UnknownHandle)?;
                dialog.end_reason.get_or_insert(EndReason::LocalHangup);
                let bye = dialog.build_bye(&sent_by);
                let destination = dialog.destination;
                self.send_and_track(bye, destination, TxOwner::Call(call))
                    .await;
                Ok(())
            }
            // already on its way down
            CallState::Terminating => Ok(()),
            CallState::Idle => Err(Error::InvalidCallState("call has not been started")),
            CallState::Terminated | CallState::Failed => Err(Error::DialogClosed),
        }
    }

    async fn cancel_call(&mut self, call: CallHandle) -> Result<()> {
        let quench_generation = self.next_generation();
        let dialog = self.dialogs.get_mut(&call).ok_or(Error::UnknownHandle)?;
        match dialog.state {
            CallState::Calling | CallState::Ringing => {}
            CallState::Terminating => return Ok(()),
            CallState::Terminated | CallState::Failed => return Err(Error::DialogClosed),
            _ => {
                return Err(Error::InvalidCallState(
                    "only an unanswered outbound call can be cancelled",
                ))
            }
        }

        dialog.end_reason.get_or_insert(EndReason::Cancelled);
        let cancel = dialog
            .build_cancel()
            .ok_or(Error::InvalidCallState("no INVITE in flight"))?;
        let destination = dialog.destination;
        let invite_key = dialog
            .invite
            .as_ref()
            .and_then(TransactionKey::of_request);

        // The INVITE transaction stays alive to match the 487, but stops
        // retransmitting. If the 487 never arrives, the Timer B tick finds
        // the spent budget and closes the dialog out locally.
        if let Some(key) = invite_key {
            if let Some(tx) = self.transactions.get_mut(&key) {
                tx.quench(quench_generation);
                self.arm_timer(
                    TIMER_B,
                    TimerEvent::Retransmit {
                        key,
                        generation: quench_generation,
                    },
                );
            }
        }
        self.send_and_track(cancel, destination, TxOwner::Call(call))
            .await;
        Ok(())
    }

    // ---- inbound traffic ---------------------------------------------

    async fn handle_message(&mut self, message: Message, source: SocketAddr) {
        match message {
            Message::Request(request) => self.on_request(request, source).await,
            Message::Response(response) => self.on_response(response, source).await,
        }
    }

    async fn on_request(&mut self, request: Request, source: SocketAddr) {
        match request.method {
            Method::Bye => self.on_remote_bye(request, source).await,
            // As a pure UAC we never see an ACK; drop it quietly
            Method::Ack => debug!("ignoring stray ACK from {}", source),
            _ => {
                debug!("{} from {} not supported", request.method, source);
                let response =
                    ResponseBuilder::response_to(&request, StatusCode::NotImplemented).build();
                self.send(Message::Response(response), source).await;
            }
        }
    }

    async fn on_remote_bye(&mut self, request: Request, source: SocketAddr) {
        let cseq = request.headers.cseq().map(|(seq, _)| seq).unwrap_or(0);
        let found = self
            .dialogs
            .iter_mut()
            .find(|(_, dialog)| dialog.matches_request(&request));

        let Some((&call, dialog)) = found else {
            debug!("BYE from {} matches no dialog", source);
            let response =
                ResponseBuilder::response_to(&request, StatusCode::CallTransactionDoesNotExist)
                    .build();
            self.send(Message::Response(response), source).await;
            return;
        };

        if dialog.state.is_closed() {
            // retransmitted BYE after we already answered: 200 again, no event
            if cseq == dialog.remote_cseq {
                debug!("{} retransmitted BYE, answering again", call);
                let ok = ResponseBuilder::response_to(&request, StatusCode::Ok).build();
                self.send(Message::Response(ok), source).await;
            }
            return;
        }

        info!("{} remote hangup", call);
        dialog.remote_cseq = cseq;
        dialog.terminate(EndReason::RemoteHangup);
        let reason = dialog.end_reason.unwrap_or(EndReason::RemoteHangup);
        let ok = ResponseBuilder::response_to(&request, StatusCode::Ok).build();

        self.send(Message::Response(ok), source).await;
        self.emit(UaEvent::Ended { call, reason }).await;
        self.schedule_dialog_sweep(call);
    }

    async fn on_response(&mut self, response: Response, source: SocketAddr) {
        let Some(key) = TransactionKey::of_response(&response) else {
            debug!("response from {} lacks branch or CSeq, dropped", source);
            return;
        };

        let quench_generation = self.next_generation();
        let Some(tx) = self.transactions.get_mut(&key) else {
            self.on_orphan_response(response, source).await;
            return;
        };
        let owner = tx.owner;

        if response.status.is_provisional() {
            // INVITE stops retransmitting once any provisional arrives;
            // non-INVITE requests keep their schedule.
            if key.method == Method::Invite {
                tx.quench(quench_generation);
            }
            if let TxOwner::Call(call) = owner {
                self.on_call_provisional(call, &response).await;
            }
            return;
        }

        self.transactions.remove(&key);
        match owner {
            TxOwner::Registration(profile) => self.on_register_final(profile, response).await,
            TxOwner::Call(call) => match key.method {
                Method::Invite => self.on_invite_final(call, response).await,
                Method::Bye => self.on_bye_final(call).await,
                // The end of a cancelled call is signalled by the 487 to
                // the INVITE, not by the 200 to the CANCEL.
                Method::Cancel => debug!("{} CANCEL answered {}", call, response.status),
                _ => debug!("{} final {} for {}", call, response.status, key.method),
            },
        }
    }

    async fn on_call_provisional(&mut self, call: CallHandle, response: &Response) {
        let Some(dialog) = self.dialogs.get_mut(&call) else {
            return;
        };
        if dialog.state.is_closed() {
            return;
        }
        dialog.apply_provisional(response);
        // 100 Trying only quenches retransmission; ringing needs 180/183
        if response.status != StatusCode::Trying && dialog.state == CallState::Calling {
            dialog.state = CallState::Ringing;
            self.emit(UaEvent::Ringing { call }).await;
        }
    }

    async fn on_invite_final(&mut self, call: CallHandle, response: Response) {
        let sent_by = self.local_addr.to_string();
        let stale = self.next_generation();
        let Some(dialog) = self.dialogs.get_mut(&call) else {
            debug!("final {} for unknown call, dropped", response.status);
            return;
        };
        if dialog.state.is_closed() {
            debug!("{} final {} after close, dropped", call, response.status);
            return;
        }
        let destination = dialog.destination;

        if response.status.is_success() {
            dialog.ring_generation = stale;
            if dialog.state == CallState::Terminating {
                // The answer beat our CANCEL: ACK the 200, then tear the
                // dialog down with an immediate BYE.
                dialog.establish_from_2xx(&response);
                let ack = dialog.build_ack_for_2xx(&response, &sent_by);
                let bye = dialog.build_bye(&sent_by);
                self.send(Message::Request(ack), destination).await;
                self.send_and_track(bye, destination, TxOwner::Call(call))
                    .await;
                return;
            }
            info!("{} established", call);
            dialog.establish_from_2xx(&response);
            let ack = dialog.build_ack_for_2xx(&response, &sent_by);
            self.send(Message::Request(ack), destination).await;
            self.emit(UaEvent::Established { call }).await;
            return;
        }

        // 3xx-6xx: ACK within the INVITE transaction
        let ack = dialog.build_ack_for_failure(&response);
        let was_cancelled = dialog.state == CallState::Terminating;
        dialog.ring_generation = stale;

        let event = if response.status == StatusCode::RequestTerminated && was_cancelled {
            dialog.terminate(EndReason::Cancelled);
            let reason = dialog.end_reason.unwrap_or(EndReason::Cancelled);
            info!("{} ended: {}", call, reason);
            UaEvent::Ended { call, reason }
        } else {
            dialog.fail();
            let code = response.status.as_u16();
            let message = if response.reason.is_empty() {
                response.status.reason_phrase().to_string()
            } else {
                response.reason.clone()
            };
            info!("{} rejected: {} {}", call, code, message);
            UaEvent::Error {
                call: Some(call),
                code,
                message,
            }
        };

        if let Some(ack) = ack {
            self.send(Message::Request(ack), destination).await;
        }
        self.emit(event).await;
        self.schedule_dialog_sweep(call);
    }

    async fn on_bye_final(&mut self, call: CallHandle) {
        let Some(dialog) = self.dialogs.get_mut(&call) else {
            return;
        };
        dialog.terminate(EndReason::LocalHangup);
        let reason = dialog.end_reason.unwrap_or(EndReason::LocalHangup);
        info!("{} ended: {}", call, reason);
        self.emit(UaEvent::Ended { call, reason }).await;
        self.schedule_dialog_sweep(call);
    }

    async fn on_register_final(&mut self, profile: ProfileHandle, response: Response) {
        let local_addr = self.local_addr;
        let refresh_generation = self.next_generation();
        let Some(entry) = self.profiles.get_mut(&profile) else {
            return;
        };
        // Only Registering, or a Registered profile refreshing, expects one
        if entry.state == RegistrationState::Unregistered
            || entry.state == RegistrationState::Failed
        {
            debug!("{} REGISTER response in state {}, dropped", profile, entry.state);
            return;
        }

        if response.status.is_auth_challenge() {
            if entry.auth_attempted {
                // second challenge in one attempt: the credentials are wrong
                self.fail_registration(profile, &Error::AuthenticationFailed.to_string())
                    .await;
                return;
            }
            if entry.profile.password.is_none() {
                let reason = format!("{} (no password configured)", Error::AuthenticationFailed);
                self.fail_registration(profile, &reason).await;
                return;
            }
            let is_proxy = response.status == StatusCode::ProxyAuthenticationRequired;
            let header = if is_proxy {
                HeaderName::ProxyAuthenticate
            } else {
                HeaderName::WwwAuthenticate
            };
            let Some(value) = response.headers.get(&header) else {
                self.fail_registration(profile, "challenge response without a challenge header")
                    .await;
                return;
            };
            let challenge = match DigestChallenge::parse(value) {
                Ok(challenge) => challenge,
                Err(error) => {
                    let reason = format!("unusable digest challenge: {}", error);
                    self.fail_registration(profile, &reason).await;
                    return;
                }
            };
            debug!("{} answering digest challenge from realm {}", profile, challenge.realm);
            let contact = contact_uri(&entry.profile.username, local_addr);
            let expires = entry.requested_expires;
            let request = entry.build_register(&contact, expires, Some((&challenge, is_proxy)));
            let destination = entry.profile.server;
            self.send_and_track(request, destination, TxOwner::Registration(profile))
                .await;
            return;
        }

        if response.status.is_success() {
            let was = entry.state;
            entry.accept_grant(response.headers.expires());
            entry.refresh_generation = refresh_generation;
            let refresh_after = entry.refresh_after();
            info!(
                "{} registered, expires {}s",
                profile,
                entry.granted_expires.unwrap_or_default()
            );

            if was != RegistrationState::Registered {
                self.emit(UaEvent::RegistrationStateChanged {
                    profile,
                    state: RegistrationState::Registered,
                    reason: None,
                })
                .await;
            }
            if let Some(delay) = refresh_after {
                self.arm_timer(
                    delay,
                    TimerEvent::RegistrationRefresh {
                        profile,
                        generation: refresh_generation,
                    },
                );
            }
            return;
        }

        let reason = format!(
            "{} {}",
            response.status.as_u16(),
            if response.reason.is_empty() {
                response.status.reason_phrase()
            } else {
                response.reason.as_str()
            }
        );
        self.fail_registration(profile, &reason).await;
    }

    async fn fail_registration(&mut self, profile: ProfileHandle, reason: &str) {
        if let Some(entry) = self.profiles.get_mut(&profile) {
            entry.state = RegistrationState::Failed;
        }
        warn!("{} registration failed: {}", profile, reason);
        self.emit(UaEvent::RegistrationStateChanged {
            profile,
            state: RegistrationState::Failed,
            reason: Some(reason.to_string()),
        })
        .await;
    }

    /// A response no transaction claims. The one legitimate case is a
    /// retransmitted 200 to an INVITE we already ACKed: answer it with the
    /// same ACK again.
    async fn on_orphan_response(&mut self, response: Response, source: SocketAddr) {
        let is_invite_2xx = matches!(response.headers.cseq(), Some((_, Method::Invite)))
            && response.status.is_success();
        if !is_invite_2xx {
            debug!("unmatched {} from {}, dropped", response.status, source);
            return;
        }
        let Some((cseq, _)) = response.headers.cseq() else {
            return;
        };
        let call_id = response.headers.call_id().map(str::to_string);

        let resend = self.dialogs.values().find_map(|dialog| {
            if Some(dialog.call_id.as_str()) == call_id.as_deref() {
                dialog
                    .ack_for_cseq(cseq)
                    .map(|ack| (ack.clone(), dialog.destination))
            } else {
                None
            }
        });

        match resend {
            Some((ack, destination)) => {
                debug!("retransmitted 200 OK, re-sending ACK to {}", destination);
                self.send(Message::Request(ack), destination).await;
            }
            None => debug!("unmatched 200 from {}, dropped", source),
        }
    }

    // ---- timers ------------------------------------------------------

    async fn handle_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::Retransmit { key, generation } => {
                self.on_retransmit_tick(key, generation).await;
            }
            TimerEvent::RegistrationRefresh {
                profile,
                generation,
            } => {
                self.on_refresh_tick(profile, generation).await;
            }
            TimerEvent::RingTimeout { call, generation } => {
                self.on_ring_timeout(call, generation).await;
            }
            TimerEvent::DialogSweep { call, generation } => {
                self.on_dialog_sweep(call, generation);
            }
        }
    }

    async fn on_retransmit_tick(&mut self, key: TransactionKey, generation: u64) {
        let Some(tx) = self.transactions.get_mut(&key) else {
            return;
        };
        if tx.generation != generation {
            return;
        }
        match tx.next_retransmit() {
            Some(delay) => {
                let message = Message::Request(tx.request.clone());
                let destination = tx.destination;
                debug!(
                    "retransmit #{} of {} to {}",
                    tx.retransmits, key.method, destination
                );
                self.send(message, destination).await;
                self.arm_timer(delay, TimerEvent::Retransmit { key, generation });
            }
            None => {
                let owner = tx.owner;
                self.transactions.remove(&key);
                self.on_transaction_timeout(owner, key).await;
            }
        }
    }

    async fn on_transaction_timeout(&mut self, owner: TxOwner, key: TransactionKey) {
        match owner {
            TxOwner::Registration(profile) => {
                self.fail_registration(profile, &Error::RegistrationTimeout.to_string())
                    .await;
            }
            TxOwner::Call(call) => {
                let stale = self.next_generation();
                let Some(dialog) = self.dialogs.get_mut(&call) else {
                    return;
                };
                if dialog.state.is_closed() {
                    return;
                }
                dialog.ring_generation = stale;
                match key.method {
                    // A cancelled INVITE whose 487 never came: close the
                    // dialog out with the reason the cancel recorded.
                    Method::Invite if dialog.state == CallState::Terminating => {
                        dialog.terminate(EndReason::Cancelled);
                        let reason = dialog.end_reason.unwrap_or(EndReason::Cancelled);
                        warn!("{} gave up waiting for the cancelled INVITE to end", call);
                        self.emit(UaEvent::Ended { call, reason }).await;
                    }
                    Method::Invite => {
                        dialog.fail();
                        warn!("{} timed out waiting for an INVITE response", call);
                        self.emit(UaEvent::Error {
                            call: Some(call),
                            code: StatusCode::RequestTimeout.as_u16(),
                            message: "no response to INVITE".to_string(),
                        })
                        .await;
                    }
                    // remote stopped answering during teardown; close locally
                    Method::Bye | Method::Cancel => {
                        dialog.terminate(EndReason::LocalHangup);
                        let reason = dialog.end_reason.unwrap_or(EndReason::LocalHangup);
                        // the quenched INVITE transaction will never
                        // complete now, drop it
                        let invite_key =
                            TransactionKey::new(key.branch.clone(), Method::Invite);
                        self.transactions.remove(&invite_key);
                        warn!("{} teardown timed out, closing locally", call);
                        self.emit(UaEvent::Ended { call, reason }).await;
                    }
                    _ => {}
                }
                let closed = self
                    .dialogs
                    .get(&call)
                    .map_or(false, |dialog| dialog.state.is_closed());
                if closed {
                    self.schedule_dialog_sweep(call);
                }
            }
        }
    }

    async fn on_refresh_tick(&mut self, profile: ProfileHandle, generation: u64) {
        let local_addr = self.local_addr;
        let Some(entry) = self.profiles.get_mut(&profile) else {
            return;
        };
        if entry.refresh_generation != generation
            || entry.state != RegistrationState::Registered
        {
            return;
        }
        debug!("{} refreshing registration", profile);
        entry.begin_attempt();
        let contact = contact_uri(&entry.profile.username, local_addr);
        let expires = entry.requested_expires;
        let request = entry.build_register(&contact, expires, None);
        let destination = entry.profile.server;
        self.send_and_track(request, destination, TxOwner::Registration(profile))
            .await;
    }

    async fn on_ring_timeout(&mut self, call: CallHandle, generation: u64) {
        let Some(dialog) = self.dialogs.get_mut(&call) else {
            return;
        };
        if dialog.ring_generation != generation
            || !matches!(dialog.state, CallState::Calling | CallState::Ringing)
        {
            return;
        }
        info!("{} unanswered after ring timeout, cancelling", call);
        dialog.end_reason.get_or_insert(EndReason::NoAnswer);
        if let Err(error) = self.cancel_call(call).await {
            debug!("{} auto-cancel: {}", call, error);
        }
    }

    fn on_dialog_sweep(&mut self, call: CallHandle, generation: u64) {
        let Some(dialog) = self.dialogs.get(&call) else {
            return;
        };
        if dialog.sweep_generation != generation || !dialog.state.is_closed() {
            return;
        }
        debug!("{} dropped after linger", call);
        self.dialogs.remove(&call);
    }

    // ---- plumbing ----------------------------------------------------

    /// A closed dialog stays around briefly so a retransmitted BYE or 200
    /// still gets its answer, then the sweep drops it
    fn schedule_dialog_sweep(&mut self, call: CallHandle) {
        let generation = self.next_generation();
        if let Some(dialog) = self.dialogs.get_mut(&call) {
            dialog.sweep_generation = generation;
            self.arm_timer(DIALOG_LINGER, TimerEvent::DialogSweep { call, generation });
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Forget in-flight REGISTER transactions for `profile`; their timers
    /// become stale no-ops
    fn drop_registration_transactions(&mut self, profile: ProfileHandle) {
        self.transactions
            .retain(|_, tx| tx.owner != TxOwner::Registration(profile));
    }

    async fn send(&self, message: Message, destination: SocketAddr) {
        if let Err(error) = self.transport.send_message(message, destination).await {
            warn!("send to {} failed: {}", destination, error);
        }
    }

    async fn send_and_track(&mut self, request: Request, destination: SocketAddr, owner: TxOwner) {
        let generation = self.next_generation();
        let Some(tx) = ClientTransaction::new(request, destination, owner, generation) else {
            warn!("request without a Via branch cannot be tracked, dropped");
            return;
        };
        let key = tx.key.clone();
        let message = Message::Request(tx.request.clone());
        let delay = tx.interval;
        self.transactions.insert(key.clone(), tx);
        self.send(message, destination).await;
        self.arm_timer(delay, TimerEvent::Retransmit { key, generation });
    }

    fn arm_timer(&self, delay: Duration, event: TimerEvent) {
        let timers = self.timers_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(event).await;
        });
    }

    async fn emit(&self, event: UaEvent) {
        let _ = self.events.send(event).await;
    }
}

/// Contact URI advertising where we can be reached
fn contact_uri(username: &str, local_addr: SocketAddr) -> Uri {
    Uri::sip(username, local_addr.ip().to_string()).with_port(local_addr.port())
}
