//! SIP message types, parsing and serialization for the sipkit stack
//!
//! This crate implements the wire layer of SIP (RFC 3261): request and
//! response messages, the headers a user agent needs to produce and consume,
//! digest authentication (RFC 2617), and a strict parser/serializer pair.
//! Messages always encode with CRLF line endings; the parser tolerates bare
//! LF for robustness against sloppy peers.

pub mod error;
pub mod message;
pub mod builder;
pub mod parser;
pub mod types;

pub use error::{Error, Result};
pub use message::{Message, Request, Response};
pub use builder::{RequestBuilder, ResponseBuilder};
pub use parser::parse_message;
pub use types::auth::{DigestChallenge, DigestCredentials};
pub use types::header::{Header, HeaderName, Headers};
pub use types::method::Method;
pub use types::status::StatusCode;
pub use types::uri::Uri;

/// Generate a Via branch parameter with the RFC 3261 magic cookie prefix.
///
/// Branches must be globally unique per transaction so that retransmissions
/// can be told apart from new requests.
pub fn generate_branch() -> String {
    format!("z9hG4bK{}", random_token(16))
}

/// Generate a From/To tag parameter.
pub fn generate_tag() -> String {
    random_token(8)
}

/// Generate a new Call-ID.
pub fn generate_call_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn random_token(len: usize) -> String {
    use rand::Rng;
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        generate_branch, generate_call_id, generate_tag, parse_message, DigestChallenge,
        DigestCredentials, Error, Header, HeaderName, Headers, Message, Method, Request,
        RequestBuilder, Response, ResponseBuilder, Result, StatusCode, Uri,
    };
}
