//! Digest authentication (RFC 2617) for REGISTER and in-dialog requests
//!
//! Only the MD5 algorithm is implemented, with and without `qop=auth`. That
//! is what SIP registrars deploy in practice.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::method::Method;
use crate::types::uri::Uri;

/// A parsed `WWW-Authenticate`/`Proxy-Authenticate` digest challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
}

impl DigestChallenge {
    /// Parse the value of a challenge header, e.g.
    /// `Digest realm="example.com", nonce="abc", qop="auth"`
    pub fn parse(value: &str) -> Result<Self, Error> {
        let value = value.trim();
        let params = value
            .strip_prefix("Digest ")
            .or_else(|| value.strip_prefix("digest "))
            .ok_or_else(|| Error::InvalidChallenge("not a digest challenge".to_string()))?;

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut algorithm = None;
        let mut qop = None;

        for param in split_challenge_params(params) {
            let Some((key, raw)) = param.split_once('=') else {
                continue;
            };
            let val = raw.trim().trim_matches('"').to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "realm" => realm = Some(val),
                "nonce" => nonce = Some(val),
                "opaque" => opaque = Some(val),
                "algorithm" => algorithm = Some(val),
                "qop" => qop = Some(val),
                _ => {}
            }
        }

        Ok(DigestChallenge {
            realm: realm.ok_or_else(|| Error::InvalidChallenge("missing realm".to_string()))?,
            nonce: nonce.ok_or_else(|| Error::InvalidChallenge("missing nonce".to_string()))?,
            opaque,
            algorithm,
            qop,
        })
    }

    /// Whether the challenge offers `qop=auth`
    pub fn offers_auth_qop(&self) -> bool {
        self.qop
            .as_deref()
            .map(|q| q.split(',').any(|part| part.trim() == "auth"))
            .unwrap_or(false)
    }
}

/// Credentials computed against a challenge, serialized into an
/// `Authorization`/`Proxy-Authorization` header value
#[derive(Debug, Clone)]
pub struct DigestCredentials {
    pub username: String,
    pub password: String,
}

impl DigestCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        DigestCredentials {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Compute the authorization header value for `method` on `uri`.
    ///
    /// response = MD5(HA1:nonce:HA2), or with nc/cnonce/qop interleaved when
    /// the challenge offers qop=auth. HA1 = MD5(user:realm:password),
    /// HA2 = MD5(method:uri).
    pub fn authorize(&self, method: &Method, uri: &Uri, challenge: &DigestChallenge) -> String {
        let digest_uri = uri.without_params().to_string();
        let ha1 = md5_hex(&format!(
            "{}:{}:{}",
            self.username, challenge.realm, self.password
        ));
        let ha2 = md5_hex(&format!("{}:{}", method, digest_uri));

        if challenge.offers_auth_qop() {
            let nc = "00000001";
            let cnonce = md5_hex(&uuid::Uuid::new_v4().to_string());
            let response = md5_hex(&format!(
                "{}:{}:{}:{}:auth:{}",
                ha1, challenge.nonce, nc, cnonce, ha2
            ));
            let mut header = format!(
                "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5, qop=auth, nc={}, cnonce=\"{}\"",
                self.username, challenge.realm, challenge.nonce, digest_uri, response, nc, cnonce
            );
            if let Some(opaque) = &challenge.opaque {
                header.push_str(&format!(", opaque=\"{}\"", opaque));
            }
            header
        } else {
            let response = md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2));
            let mut header = format!(
                "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
                self.username, challenge.realm, challenge.nonce, digest_uri, response
            );
            if let Some(opaque) = &challenge.opaque {
                header.push_str(&format!(", opaque=\"{}\"", opaque));
            }
            header
        }
    }
}

/// Split challenge parameters on commas that are outside quoted strings
fn split_challenge_params(params: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in params.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                out.push(params[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(params[start..].trim());
    out
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
