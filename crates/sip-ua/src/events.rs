//! Lifecycle events delivered to the embedding application
//!
//! Events are emitted by the coordinator's event loop in the order the
//! underlying transitions happen, so ordering per handle is guaranteed. The
//! surface mirrors what a calling UI needs: progress, establishment, an end
//! with a reason, and errors with a code and human-readable message.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dialog::CallHandle;
use crate::profile::ProfileHandle;
use crate::registration::RegistrationState;

/// Why a call ended without being an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// We hung up
    LocalHangup,
    /// The remote party sent BYE
    RemoteHangup,
    /// The caller cancelled before the call was answered
    Cancelled,
    /// The ring timeout elapsed before an answer
    NoAnswer,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::LocalHangup => write!(f, "local hangup"),
            EndReason::RemoteHangup => write!(f, "remote hangup"),
            EndReason::Cancelled => write!(f, "cancelled"),
            EndReason::NoAnswer => write!(f, "no answer"),
        }
    }
}

/// Events emitted by the session coordinator
#[derive(Debug, Clone)]
pub enum UaEvent {
    /// A registration moved to a new state
    RegistrationStateChanged {
        profile: ProfileHandle,
        state: RegistrationState,
        /// Set when the transition is a failure (auth rejected, timeout, ...)
        reason: Option<String>,
    },

    /// The callee is being alerted
    Ringing { call: CallHandle },

    /// The call is up
    Established { call: CallHandle },

    /// The call ended normally
    Ended { call: CallHandle, reason: EndReason },

    /// A failure the application should surface
    Error {
        /// The call this error belongs to, if any
        call: Option<CallHandle>,
        /// SIP status code, or 408 for local timeouts
        code: u16,
        message: String,
    },
}
