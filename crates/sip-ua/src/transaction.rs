//! Client transactions and their retransmission schedule
//!
//! A transaction is one request awaiting its final response, keyed by the
//! Via branch plus the CSeq method (CANCEL shares its INVITE's branch, so
//! branch alone is not unique). Over UDP the request is retransmitted with
//! exponential backoff from T1; when the budget is exhausted the next timer
//! tick reports a timeout to the transaction's owner.
//!
//! Timers are cooperative: each scheduled timer carries the generation the
//! transaction had when it was armed, and a timer whose generation no longer
//! matches is a no-op. That makes cancellation race-free without locking.

use std::net::SocketAddr;
use std::time::Duration;

use sipkit_core::{Method, Request, Response};

use crate::dialog::CallHandle;
use crate::profile::ProfileHandle;

/// RFC 3261 T1: base retransmission interval
pub(crate) const T1: Duration = Duration::from_millis(500);

/// Retransmissions before a transaction times out
pub(crate) const MAX_RETRANSMITS: u32 = 3;

/// RFC 3261 Timer B: overall deadline for a quenched INVITE transaction
/// (64*T1). A cancelled INVITE whose 487 never arrives is closed out when
/// this fires.
pub(crate) const TIMER_B: Duration = Duration::from_millis(64 * 500);

/// Identifies a client transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TransactionKey {
    pub branch: String,
    pub method: Method,
}

impl TransactionKey {
    pub fn new(branch: impl Into<String>, method: Method) -> Self {
        TransactionKey {
            branch: branch.into(),
            method,
        }
    }

    /// Key of the transaction `request` belongs to
    pub fn of_request(request: &Request) -> Option<Self> {
        let branch = request.headers.via_branch()?;
        Some(TransactionKey::new(branch, request.method.clone()))
    }

    /// Key of the transaction `response` answers: top Via branch plus the
    /// CSeq method
    pub fn of_response(response: &Response) -> Option<Self> {
        let branch = response.headers.via_branch()?;
        let (_, method) = response.headers.cseq()?;
        Some(TransactionKey::new(branch, method))
    }
}

/// Who gets notified when the transaction completes or times out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxOwner {
    Registration(ProfileHandle),
    Call(CallHandle),
}

/// An in-flight client transaction
#[derive(Debug)]
pub(crate) struct ClientTransaction {
    pub key: TransactionKey,
    pub request: Request,
    pub destination: SocketAddr,
    pub owner: TxOwner,
    /// Matched against the generation carried by retransmission timers
    pub generation: u64,
    pub retransmits: u32,
    pub interval: Duration,
}

impl ClientTransaction {
    pub fn new(
        request: Request,
        destination: SocketAddr,
        owner: TxOwner,
        generation: u64,
    ) -> Option<Self> {
        let key = TransactionKey::of_request(&request)?;
        Some(ClientTransaction {
            key,
            request,
            destination,
            owner,
            generation,
            retransmits: 0,
            interval: T1,
        })
    }

    /// Advance the schedule. Returns the delay before the next tick, or
    /// `None` when the budget is spent and this tick means timeout.
    pub fn next_retransmit(&mut self) -> Option<Duration> {
        if self.retransmits >= MAX_RETRANSMITS {
            return None;
        }
        self.retransmits += 1;
        self.interval *= 2;
        Some(self.interval)
    }

    /// Stop retransmitting (e.g. a provisional response arrived) while the
    /// transaction stays around to match the final response.
    pub fn quench(&mut self, new_generation: u64) {
        self.generation = new_generation;
        self.retransmits = MAX_RETRANSMITS;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipkit_core::{RequestBuilder, ResponseBuilder, StatusCode, Uri};

    fn request(method: Method, branch: &str) -> Request {
        let uri: Uri = "sip:bob@example.net".parse().unwrap();
        RequestBuilder::new(method.clone(), uri.clone())
            .via("10.0.0.1:5060", branch)
            .from(None, &"sip:alice@example.com".parse().unwrap(), Some("t"))
            .to(None, &uri, None)
            .call_id("tx-test")
            .cseq_for(1, &method)
            .build()
    }

    #[test]
    fn test_key_of_response_uses_cseq_method() {
        let invite = request(Method::Invite, "z9hG4bKinv");
        let response = ResponseBuilder::response_to(&invite, StatusCode::Ok).build();
        let key = TransactionKey::of_response(&response).unwrap();
        assert_eq!(key, TransactionKey::new("z9hG4bKinv", Method::Invite));
    }

    #[test]
    fn test_cancel_and_invite_share_branch_different_keys() {
        let invite_key = TransactionKey::new("z9hG4bKx", Method::Invite);
        let cancel_key = TransactionKey::new("z9hG4bKx", Method::Cancel);
        assert_ne!(invite_key, cancel_key);
    }

    #[test]
    fn test_retransmission_schedule() {
        let destination = "198.51.100.10:5060".parse().unwrap();
        let mut tx = ClientTransaction::new(
            request(Method::Register, "z9hG4bKreg"),
            destination,
            TxOwner::Registration(crate::profile::ProfileHandle::new()),
            1,
        )
        .unwrap();

        // 500ms base doubles on each retransmission, then timeout
        assert_eq!(tx.interval, Duration::from_millis(500));
        assert_eq!(tx.next_retransmit(), Some(Duration::from_millis(1000)));
        assert_eq!(tx.next_retransmit(), Some(Duration::from_millis(2000)));
        assert_eq!(tx.next_retransmit(), Some(Duration::from_millis(4000)));
        assert_eq!(tx.next_retransmit(), None);
    }

    #[test]
    fn test_quench_stops_schedule_and_bumps_generation() {
        let destination = "198.51.100.10:5060".parse().unwrap();
        let mut tx = ClientTransaction::new(
            request(Method::Invite, "z9hG4bKq"),
            destination,
            TxOwner::Call(CallHandle::new()),
            1,
        )
        .unwrap();
        tx.quench(7);
        assert_eq!(tx.generation, 7);
        assert_eq!(tx.next_retransmit(), None);
    }
}
