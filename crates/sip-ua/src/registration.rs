//! Registration state and REGISTER request construction
//!
//! One entry exists per configured profile. The coordinator's event loop
//! drives the entry through its states in response to transport events and
//! timers; this module holds the record itself and the pure request-building
//! logic so the flow can be unit tested without a network.
//!
//! State transitions:
//! `Unregistered -> Registering -> Registered` on 200 OK, with a refresh
//! re-REGISTER scheduled at half the granted Expires; a digest challenge is
//! answered exactly once before the attempt fails.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sipkit_core::{
    generate_branch, generate_call_id, generate_tag, DigestChallenge, DigestCredentials,
    HeaderName, Method, Request, RequestBuilder, Uri,
};

use crate::profile::Profile;

/// Default registration lifetime requested from the registrar, in seconds
pub const DEFAULT_EXPIRES: u32 = 3600;

/// Floor for the refresh interval, so a registrar granting a tiny lifetime
/// cannot drive a tight re-REGISTER loop
pub const MIN_REFRESH: Duration = Duration::from_secs(5);

/// Current state of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    /// No binding at the registrar (initial state, or after unregister)
    Unregistered,
    /// REGISTER sent, waiting for the final response
    Registering,
    /// The registrar accepted the binding; a refresh is scheduled
    Registered,
    /// Terminal failure: bad credentials, rejection, or timeout
    Failed,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::Unregistered => write!(f, "Unregistered"),
            RegistrationState::Registering => write!(f, "Registering"),
            RegistrationState::Registered => write!(f, "Registered"),
            RegistrationState::Failed => write!(f, "Failed"),
        }
    }
}

/// The registration record for one profile
#[derive(Debug, Clone)]
pub(crate) struct RegistrationEntry {
    pub profile: Profile,
    pub state: RegistrationState,
    /// All REGISTERs for one profile share a Call-ID; the CSeq increments
    pub call_id: String,
    pub cseq: u32,
    pub from_tag: String,
    /// Nonce of the last challenge answered, kept for diagnostics
    pub last_nonce: Option<String>,
    /// Whether the current attempt already answered a challenge; a second
    /// challenge is a terminal authentication failure
    pub auth_attempted: bool,
    /// Expires granted by the registrar on the last 200 OK
    pub granted_expires: Option<u32>,
    pub requested_expires: u32,
    /// Invalidates stale refresh timers after re-registration or unregister
    pub refresh_generation: u64,
}

impl RegistrationEntry {
    pub fn new(profile: Profile) -> Self {
        RegistrationEntry {
            profile,
            state: RegistrationState::Unregistered,
            call_id: generate_call_id(),
            cseq: 0,
            from_tag: generate_tag(),
            last_nonce: None,
            auth_attempted: false,
            granted_expires: None,
            requested_expires: DEFAULT_EXPIRES,
            refresh_generation: 0,
        }
    }

    /// Begin a fresh REGISTER attempt (initial, refresh, or unregister)
    pub fn begin_attempt(&mut self) {
        self.auth_attempted = false;
    }

    /// Build the next REGISTER request.
    ///
    /// `expires` of zero removes the binding. When answering a challenge the
    /// caller passes it in together with the header it arrived on, and the
    /// matching authorization header is attached.
    pub fn build_register(
        &mut self,
        contact: &Uri,
        expires: u32,
        challenge: Option<(&DigestChallenge, bool)>,
    ) -> Request {
        self.cseq += 1;
        let aor = self.profile.aor();
        let registrar = self.profile.registrar();
        let sent_by = contact_sent_by(contact);

        let mut builder = RequestBuilder::new(Method::Register, registrar.clone())
            .via(&sent_by, &generate_branch())
            .from(
                self.profile.display_name.as_deref(),
                &aor,
                Some(&self.from_tag),
            )
            .to(None, &aor, None)
            .call_id(&self.call_id)
            .cseq(self.cseq)
            .contact(contact)
            .expires(expires);

        if let Some((challenge, is_proxy)) = challenge {
            // A challenge without a configured password is caught by the
            // caller before getting here.
            let password = self.profile.password.as_deref().unwrap_or_default();
            let credentials = DigestCredentials::new(self.profile.username.clone(), password);
            let value = credentials.authorize(&Method::Register, &registrar, challenge);
            let header = if is_proxy {
                HeaderName::ProxyAuthorization
            } else {
                HeaderName::Authorization
            };
            builder = builder.authorization(header, &value);
            self.last_nonce = Some(challenge.nonce.clone());
            self.auth_attempted = true;
        }

        builder.build()
    }

    /// Store the granted lifetime from a 200 OK, bounded by what we asked for
    pub fn accept_grant(&mut self, server_expires: Option<u32>) {
        let granted = server_expires
            .unwrap_or(DEFAULT_EXPIRES)
            .min(self.requested_expires.max(1));
        self.granted_expires = Some(granted);
        self.state = RegistrationState::Registered;
    }

    /// When to re-REGISTER: half of the granted lifetime, never below
    /// [`MIN_REFRESH`]
    pub fn refresh_after(&self) -> Option<Duration> {
        self.granted_expires
            .map(|granted| Duration::from_secs(u64::from(granted) / 2).max(MIN_REFRESH))
    }
}

/// host:port form of a contact URI for the Via sent-by field
fn contact_sent_by(contact: &Uri) -> String {
    match contact.port {
        Some(port) => format!("{}:{}", contact.host, port),
        None => contact.host.clone(),
    }
}
