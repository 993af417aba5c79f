//! Error types for the SIP codec layer

use thiserror::Error;

/// Result type for codec operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while parsing or building SIP messages
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The input could not be parsed as a SIP message
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A status code outside the valid 100..=699 range
    #[error("invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// A URI that does not follow the sip:/sips: grammar
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// A required header is absent
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    /// A header is present but its value cannot be interpreted
    #[error("invalid {0} header: {1}")]
    InvalidHeader(&'static str, String),

    /// An authentication challenge missing mandatory digest parameters
    #[error("invalid digest challenge: {0}")]
    InvalidChallenge(String),
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }
}
