//! Core SIP protocol types

pub mod auth;
pub mod header;
pub mod method;
pub mod status;
pub mod uri;
