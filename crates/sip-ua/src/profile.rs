//! User profiles
//!
//! A profile is the identity a registration acts for: username and domain
//! (the address-of-record), optional display name and password, and the
//! registrar's network address. Created by the embedding application,
//! owned by the coordinator once configured.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sipkit_core::Uri;

use crate::error::{Error, Result};

/// A SIP user profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// User part of the address-of-record, e.g. `alice`
    pub username: String,
    /// Domain part of the address-of-record, e.g. `sip.example.com`
    pub domain: String,
    /// Display name rendered into From headers
    pub display_name: Option<String>,
    /// Password for digest authentication; without one, a challenged
    /// registration fails immediately
    pub password: Option<String>,
    /// Network address of the registrar/outbound proxy
    pub server: SocketAddr,
}

impl Profile {
    pub fn new(
        username: impl Into<String>,
        domain: impl Into<String>,
        server: SocketAddr,
    ) -> Self {
        Profile {
            username: username.into(),
            domain: domain.into(),
            display_name: None,
            password: None,
            server,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// Username and domain must be non-empty before any registration attempt
    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(Error::config("profile username must not be empty"));
        }
        if self.domain.trim().is_empty() {
            return Err(Error::config("profile domain must not be empty"));
        }
        Ok(())
    }

    /// The address-of-record, `sip:username@domain`
    pub fn aor(&self) -> Uri {
        Uri::sip(self.username.clone(), self.domain.clone())
    }

    /// The registrar URI, `sip:domain`
    pub fn registrar(&self) -> Uri {
        Uri::sip_host(self.domain.clone())
    }

    /// Two profiles are the same identity when username and domain match
    pub fn same_identity(&self, other: &Profile) -> bool {
        self.username == other.username && self.domain == other.domain
    }
}

/// Opaque handle to a configured profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileHandle(Uuid);

impl ProfileHandle {
    pub(crate) fn new() -> Self {
        ProfileHandle(Uuid::new_v4())
    }
}

impl fmt::Display for ProfileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "profile-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> SocketAddr {
        "198.51.100.10:5060".parse().unwrap()
    }

    #[test]
    fn test_validation() {
        assert!(Profile::new("alice", "sip.example.com", server()).validate().is_ok());
        assert!(Profile::new("", "sip.example.com", server()).validate().is_err());
        assert!(Profile::new("alice", "  ", server()).validate().is_err());
    }

    #[test]
    fn test_aor_and_registrar() {
        let profile = Profile::new("alice", "sip.example.com", server());
        assert_eq!(profile.aor().to_string(), "sip:alice@sip.example.com");
        assert_eq!(profile.registrar().to_string(), "sip:sip.example.com");
    }

    #[test]
    fn test_same_identity_ignores_password() {
        let a = Profile::new("alice", "sip.example.com", server());
        let b = Profile::new("alice", "sip.example.com", server()).with_password("pw");
        let c = Profile::new("bob", "sip.example.com", server());
        assert!(a.same_identity(&b));
        assert!(!a.same_identity(&c));
    }
}
