//! SIP user-agent core for the sipkit stack
//!
//! This crate owns the signaling logic a softphone shell delegates to a SIP
//! stack: digest-authenticated registration with automatic refresh, an
//! outbound call (dialog) state machine with RFC 3261 transaction timers,
//! and a [`SessionCoordinator`] facade that multiplexes everything over one
//! injected transport.
//!
//! All dialog and registration state lives inside a single event-loop task;
//! the public API posts commands into that loop and the loop posts lifecycle
//! events back, so callers never observe a torn state and never take a lock.

pub mod coordinator;
pub mod dialog;
pub mod error;
pub mod events;
pub mod profile;
pub mod registration;

mod transaction;

pub use coordinator::{CoordinatorConfig, SessionCoordinator};
pub use dialog::{CallHandle, CallState};
pub use error::{Error, Result};
pub use events::{EndReason, UaEvent};
pub use profile::{Profile, ProfileHandle};
pub use registration::RegistrationState;

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        CallHandle, CallState, EndReason, Error, Profile, ProfileHandle, RegistrationState,
        Result, SessionCoordinator, UaEvent,
    };
}
