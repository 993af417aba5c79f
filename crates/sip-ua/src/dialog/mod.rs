//! Outbound call dialogs (RFC 3261 Section 12)
//!
//! A dialog is identified by Call-ID plus the two tags. This module owns the
//! dialog record, its state machine, and the construction of every in-dialog
//! request: the INVITE itself, the ACK (both the 2xx form, which is its own
//! transaction, and the failure form, which reuses the INVITE's branch),
//! BYE, and CANCEL.
//!
//! Outbound state flow:
//! `Idle -> Calling -> Ringing -> Established -> Terminating -> Terminated`,
//! with `Failed` reachable from Calling/Ringing on a final failure response
//! or transaction timeout. Once Terminated or Failed, every operation on the
//! dialog answers `DialogClosed`.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use sipkit_core::{
    generate_branch, generate_call_id, generate_tag, HeaderName, Method, Request, RequestBuilder,
    Response, Uri,
};

use crate::events::EndReason;

/// Opaque handle to a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallHandle(Uuid);

impl CallHandle {
    pub(crate) fn new() -> Self {
        CallHandle(Uuid::new_v4())
    }
}

impl fmt::Display for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// State of a call dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// Created but no INVITE sent yet
    Idle,
    /// INVITE sent, no provisional response yet
    Calling,
    /// Provisional response received, callee is being alerted
    Ringing,
    /// 200 OK received and ACKed; media may flow
    Established,
    /// BYE or CANCEL sent (or remote BYE received), waiting to finish
    Terminating,
    /// Clean end
    Terminated,
    /// Terminal failure (rejection or timeout)
    Failed,
}

impl CallState {
    /// Terminated and Failed are terminal; nothing further is valid
    pub fn is_closed(&self) -> bool {
        matches!(self, CallState::Terminated | CallState::Failed)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "Idle",
            CallState::Calling => "Calling",
            CallState::Ringing => "Ringing",
            CallState::Established => "Established",
            CallState::Terminating => "Terminating",
            CallState::Terminated => "Terminated",
            CallState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// One outbound call dialog
#[derive(Debug, Clone)]
pub(crate) struct Dialog {
    pub handle: CallHandle,
    pub state: CallState,
    pub call_id: String,
    pub local_uri: Uri,
    pub remote_uri: Uri,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    pub local_cseq: u32,
    pub remote_cseq: u32,
    /// Where in-dialog requests go (Contact of the 2xx, else the peer URI)
    pub remote_target: Uri,
    /// Record-Route set, stored in the order we must emit Route headers
    pub route_set: Vec<Uri>,
    /// Network destination for every message of this dialog
    pub destination: SocketAddr,
    /// The original INVITE, kept for CANCEL and the failure ACK
    pub invite: Option<Request>,
    /// The ACK sent for a 2xx, kept so a retransmitted 200 gets the same
    /// ACK again instead of a new one
    pub last_ack: Option<(u32, Request)>,
    /// Why the call is ending, decided when termination starts and reported
    /// once the dialog reaches Terminated
    pub end_reason: Option<EndReason>,
    /// Invalidates the pending ring timer once the call progresses
    pub ring_generation: u64,
    /// Matched by the cleanup timer that finally drops a closed dialog
    pub sweep_generation: u64,
}

impl Dialog {
    pub fn new_outbound(local_uri: Uri, remote_uri: Uri, destination: SocketAddr) -> Self {
        Dialog {
            handle: CallHandle::new(),
            state: CallState::Idle,
            call_id: generate_call_id(),
            local_uri,
            remote_uri: remote_uri.clone(),
            local_tag: generate_tag(),
            remote_tag: None,
            local_cseq: 0,
            remote_cseq: 0,
            remote_target: remote_uri,
            route_set: Vec::new(),
            destination,
            invite: None,
            last_ack: None,
            end_reason: None,
            ring_generation: 0,
            sweep_generation: 0,
        }
    }

    /// Build the initial INVITE and move to Calling
    pub fn build_invite(
        &mut self,
        display_name: Option<&str>,
        contact: &Uri,
        sent_by: &str,
    ) -> Request {
        self.local_cseq += 1;
        let request = RequestBuilder::new(Method::Invite, self.remote_uri.clone())
            .via(sent_by, &generate_branch())
            .from(display_name, &self.local_uri, Some(&self.local_tag))
            .to(None, &self.remote_uri, None)
            .call_id(&self.call_id)
            .cseq(self.local_cseq)
            .contact(contact)
            .build();
        self.invite = Some(request.clone());
        self.state = CallState::Calling;
        request
    }

    /// A provisional response arrived; learn the early remote tag if present
    pub fn apply_provisional(&mut self, response: &Response) {
        if self.remote_tag.is_none() {
            if let Some(tag) = response.headers.to_tag() {
                self.remote_tag = Some(tag.to_string());
            }
        }
    }

    /// A 2xx to the INVITE arrived: learn the remote tag, the remote target
    /// from Contact, and the route set from Record-Route (reversed, since we
    /// are the initiator). Moves to Established.
    pub fn establish_from_2xx(&mut self, response: &Response) {
        if let Some(tag) = response.headers.to_tag() {
            self.remote_tag = Some(tag.to_string());
        }
        if let Some(contact) = response.headers.contact_uri() {
            self.remote_target = contact;
        }
        let mut routes = response.headers.record_routes();
        routes.reverse();
        self.route_set = routes;
        debug!("dialog {} established, remote target {}", self.handle, self.remote_target);
        self.state = CallState::Established;
    }

    /// Build the ACK for a 2xx response.
    ///
    /// Per RFC 3261 13.2.2.4 this ACK is a new transaction: fresh branch,
    /// Request-URI from the remote target, Route headers from the dialog's
    /// route set, To copied verbatim from the response so the remote tag is
    /// carried. The built ACK is remembered so a retransmitted 200 with the
    /// same CSeq re-sends it rather than minting another.
    pub fn build_ack_for_2xx(&mut self, response: &Response, sent_by: &str) -> Request {
        let invite_cseq = self
            .invite
            .as_ref()
            .and_then(|inv| inv.headers.cseq())
            .map(|(seq, _)| seq)
            .unwrap_or(self.local_cseq);

        let mut builder = RequestBuilder::new(Method::Ack, self.remote_target.clone())
            .via(sent_by, &generate_branch())
            .routes(&self.route_set)
            .call_id(&self.call_id)
            .cseq_for(invite_cseq, &Method::Ack);

        if let Some(from) = self
            .invite
            .as_ref()
            .and_then(|inv| inv.headers.get(&HeaderName::From))
        {
            builder = builder.header(HeaderName::From, from);
        }
        if let Some(to) = response.headers.get(&HeaderName::To) {
            builder = builder.raw_to(to);
        }

        let ack = builder.build();
        self.last_ack = Some((invite_cseq, ack.clone()));
        ack
    }

    /// The ACK previously sent for `cseq`, if any
    pub fn ack_for_cseq(&self, cseq: u32) -> Option<&Request> {
        match &self.last_ack {
            Some((acked, ack)) if *acked == cseq => Some(ack),
            _ => None,
        }
    }

    /// Build the ACK for a final failure response (3xx-6xx).
    ///
    /// This ACK belongs to the INVITE transaction: same branch, same
    /// Request-URI, To taken from the response.
    pub fn build_ack_for_failure(&self, response: &Response) -> Option<Request> {
        let invite = self.invite.as_ref()?;
        let (invite_cseq, _) = invite.headers.cseq()?;
        let via = invite.headers.get(&HeaderName::Via)?;

        let mut builder = RequestBuilder::new(Method::Ack, invite.uri.clone())
            .raw_via(via)
            .call_id(&self.call_id)
            .cseq_for(invite_cseq, &Method::Ack);

        if let Some(from) = invite.headers.get(&HeaderName::From) {
            builder = builder.header(HeaderName::From, from);
        }
        if let Some(to) = response.headers.get(&HeaderName::To) {
            builder = builder.raw_to(to);
        }
        Some(builder.build())
    }

    /// Build an in-dialog BYE and move to Terminating
    pub fn build_bye(&mut self, sent_by: &str) -> Request {
        self.local_cseq += 1;
        let request = RequestBuilder::new(Method::Bye, self.remote_target.clone())
            .via(sent_by, &generate_branch())
            .routes(&self.route_set)
            .from(None, &self.local_uri, Some(&self.local_tag))
            .to(None, &self.remote_uri, self.remote_tag.as_deref())
            .call_id(&self.call_id)
            .cseq(self.local_cseq)
            .build();
        self.state = CallState::Terminating;
        request
    }

    /// Build a CANCEL for the pending INVITE and move to Terminating.
    ///
    /// CANCEL copies the INVITE's Request-URI, Via (same branch), From, To
    /// (without remote tag) and Call-ID; its CSeq keeps the INVITE's number
    /// with method CANCEL.
    pub fn build_cancel(&mut self) -> Option<Request> {
        let invite = self.invite.as_ref()?;
        let (invite_cseq, _) = invite.headers.cseq()?;
        let via = invite.headers.get(&HeaderName::Via)?;
        let from = invite.headers.get(&HeaderName::From)?;
        let to = invite.headers.get(&HeaderName::To)?;

        let request = RequestBuilder::new(Method::Cancel, invite.uri.clone())
            .raw_via(via)
            .header(HeaderName::From, from)
            .raw_to(to)
            .call_id(&self.call_id)
            .cseq_for(invite_cseq, &Method::Cancel)
            .build();
        self.state = CallState::Terminating;
        Some(request)
    }

    /// Whether an inbound request belongs to this dialog: Call-ID matches,
    /// the To tag is ours (or absent), and the From tag is the remote's
    pub fn matches_request(&self, request: &Request) -> bool {
        if request.headers.call_id() != Some(self.call_id.as_str()) {
            return false;
        }
        if let Some(to_tag) = request.headers.to_tag() {
            if to_tag != self.local_tag {
                return false;
            }
        }
        match (&self.remote_tag, request.headers.from_tag()) {
            (Some(ours), Some(theirs)) => ours == theirs,
            // No remote tag learned yet: accept on Call-ID alone
            (None, _) => true,
            (Some(_), None) => false,
        }
    }

    pub fn terminate(&mut self, reason: EndReason) {
        self.end_reason.get_or_insert(reason);
        self.state = CallState::Terminated;
    }

    pub fn fail(&mut self) {
        self.state = CallState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipkit_core::{ResponseBuilder, StatusCode};

    fn dialog() -> Dialog {
        Dialog::new_outbound(
            "sip:alice@sip.example.com".parse().unwrap(),
            "sip:bob@example.net".parse().unwrap(),
            "198.51.100.10:5060".parse().unwrap(),
        )
    }

    fn invited() -> (Dialog, Request) {
        let mut dialog = dialog();
        let contact = "sip:alice@10.0.0.1:5060".parse().unwrap();
        let invite = dialog.build_invite(Some("Alice"), &contact, "10.0.0.1:5060");
        (dialog, invite)
    }

    fn ok_to(invite: &Request, remote_tag: &str) -> Response {
        ResponseBuilder::response_to(invite, StatusCode::Ok)
            .to_tag(remote_tag)
            .header(HeaderName::Contact, "<sip:bob@192.0.2.7:5062>")
            .build()
    }

    #[test]
    fn test_invite_moves_to_calling() {
        let (dialog, invite) = invited();
        assert_eq!(dialog.state, CallState::Calling);
        assert_eq!(invite.method, Method::Invite);
        assert_eq!(invite.headers.cseq(), Some((1, Method::Invite)));
        assert_eq!(invite.headers.from_tag(), Some(dialog.local_tag.as_str()));
        assert_eq!(invite.headers.to_tag(), None);
    }

    #[test]
    fn test_establish_learns_tag_target_and_routes() {
        let (mut dialog, invite) = invited();
        let ok = ResponseBuilder::response_to(&invite, StatusCode::Ok)
            .to_tag("bobtag")
            .header(HeaderName::Contact, "<sip:bob@192.0.2.7:5062>")
            .header(HeaderName::RecordRoute, "<sip:p1.example.com;lr>")
            .header(HeaderName::RecordRoute, "<sip:p2.example.com;lr>")
            .build();

        dialog.establish_from_2xx(&ok);
        assert_eq!(dialog.state, CallState::Established);
        assert_eq!(dialog.remote_tag.as_deref(), Some("bobtag"));
        assert_eq!(dialog.remote_target.to_string(), "sip:bob@192.0.2.7:5062");
        // initiator reverses the Record-Route order
        assert_eq!(dialog.route_set[0].host, "p2.example.com");
        assert_eq!(dialog.route_set[1].host, "p1.example.com");
    }

    #[test]
    fn test_ack_for_2xx_is_new_transaction_with_response_to() {
        let (mut dialog, invite) = invited();
        let ok = ok_to(&invite, "bobtag");
        dialog.establish_from_2xx(&ok);
        let ack = dialog.build_ack_for_2xx(&ok, "10.0.0.1:5060");

        assert_eq!(ack.method, Method::Ack);
        assert_eq!(ack.uri.to_string(), "sip:bob@192.0.2.7:5062");
        assert_eq!(ack.headers.cseq(), Some((1, Method::Ack)));
        assert_eq!(ack.headers.to_tag(), Some("bobtag"));
        // fresh branch, not the INVITE's
        assert_ne!(ack.headers.via_branch(), invite.headers.via_branch());
        // idempotency record
        assert!(dialog.ack_for_cseq(1).is_some());
        assert!(dialog.ack_for_cseq(2).is_none());
    }

    #[test]
    fn test_ack_for_failure_reuses_invite_branch() {
        let (mut dialog, invite) = invited();
        let busy = ResponseBuilder::response_to(&invite, StatusCode::BusyHere)
            .to_tag("bobtag")
            .build();
        dialog.fail();
        let ack = dialog.build_ack_for_failure(&busy).unwrap();
        assert_eq!(ack.headers.via_branch(), invite.headers.via_branch());
        assert_eq!(ack.uri, invite.uri);
        assert_eq!(ack.headers.cseq(), Some((1, Method::Ack)));
    }

    #[test]
    fn test_bye_increments_cseq_and_targets_contact() {
        let (mut dialog, invite) = invited();
        dialog.establish_from_2xx(&ok_to(&invite, "bobtag"));
        let bye = dialog.build_bye("10.0.0.1:5060");
        assert_eq!(dialog.state, CallState::Terminating);
        assert_eq!(bye.headers.cseq(), Some((2, Method::Bye)));
        assert_eq!(bye.uri.to_string(), "sip:bob@192.0.2.7:5062");
        assert_eq!(bye.headers.to_tag(), Some("bobtag"));
    }

    #[test]
    fn test_cancel_copies_invite_identifiers() {
        let (mut dialog, invite) = invited();
        let cancel = dialog.build_cancel().unwrap();
        assert_eq!(dialog.state, CallState::Terminating);
        assert_eq!(cancel.method, Method::Cancel);
        assert_eq!(cancel.uri, invite.uri);
        assert_eq!(cancel.headers.via_branch(), invite.headers.via_branch());
        assert_eq!(cancel.headers.cseq(), Some((1, Method::Cancel)));
        assert_eq!(cancel.headers.to_tag(), None);
    }

    #[test]
    fn test_matches_request_by_call_id_and_tags() {
        let (mut dialog, invite) = invited();
        dialog.establish_from_2xx(&ok_to(&invite, "bobtag"));

        let bye = RequestBuilder::new(Method::Bye, dialog.local_uri.clone())
            .via("192.0.2.7:5062", "z9hG4bKremote")
            .from(None, &dialog.remote_uri, Some("bobtag"))
            .to(None, &dialog.local_uri, Some(&dialog.local_tag))
            .call_id(&dialog.call_id)
            .cseq(1)
            .build();
        assert!(dialog.matches_request(&bye));

        let other = RequestBuilder::new(Method::Bye, dialog.local_uri.clone())
            .via("192.0.2.7:5062", "z9hG4bKother")
            .from(None, &dialog.remote_uri, Some("nottheirs"))
            .to(None, &dialog.local_uri, Some(&dialog.local_tag))
            .call_id(&dialog.call_id)
            .cseq(1)
            .build();
        assert!(!dialog.matches_request(&other));
    }

    #[test]
    fn test_terminal_states_are_closed() {
        let (mut dialog, _) = invited();
        assert!(!dialog.state.is_closed());
        dialog.terminate(EndReason::LocalHangup);
        assert!(dialog.state.is_closed());
        assert_eq!(dialog.end_reason, Some(EndReason::LocalHangup));

        // first reason wins
        dialog.terminate(EndReason::RemoteHangup);
        assert_eq!(dialog.end_reason, Some(EndReason::LocalHangup));
    }
}
