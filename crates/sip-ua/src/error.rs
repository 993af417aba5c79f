//! Error types for the user-agent core

use thiserror::Error;

/// Result type for user-agent operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the user-agent core
///
/// Synchronous failures (bad profile, wrong state, unknown handle) come back
/// as `Err` from the call itself; asynchronous protocol failures arrive as
/// [`crate::UaEvent`]s. Nothing is swallowed.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing profile fields
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The profile has no active registration; register first
    #[error("profile is not registered")]
    NotRegistered,

    /// Credentials rejected after the single digest retry
    #[error("authentication failed")]
    AuthenticationFailed,

    /// No response to REGISTER after the retransmission schedule
    #[error("registration timed out")]
    RegistrationTimeout,

    /// Socket-level failure
    #[error("transport error: {0}")]
    Transport(#[from] sipkit_transport::Error),

    /// Operation on a dialog that already reached Terminated or Failed
    #[error("dialog closed")]
    DialogClosed,

    /// The operation is not valid in the dialog's current state
    #[error("invalid call state: {0}")]
    InvalidCallState(&'static str),

    /// The handle does not name a known profile or call
    #[error("unknown handle")]
    UnknownHandle,

    /// The coordinator's event loop has shut down
    #[error("session coordinator unavailable")]
    ChannelClosed,
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }
}
