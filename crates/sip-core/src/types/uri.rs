//! SIP URIs
//!
//! A deliberately small model of the RFC 3261 URI grammar: scheme, optional
//! user, host, optional port, and the raw tail of parameters. That covers
//! addressing for a user agent; parameters are preserved but not interpreted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// URI scheme, sip or sips
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    Sip,
    Sips,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Sip => f.write_str("sip"),
            Scheme::Sips => f.write_str("sips"),
        }
    }
}

/// A SIP URI such as `sip:alice@example.com:5060`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    /// Raw `;param=value` tail, preserved verbatim (without the leading `;`)
    pub params: Option<String>,
}

impl Uri {
    /// Build a `sip:` URI with a user part
    pub fn sip(user: impl Into<String>, host: impl Into<String>) -> Self {
        Uri {
            scheme: Scheme::Sip,
            user: Some(user.into()),
            host: host.into(),
            port: None,
            params: None,
        }
    }

    /// Build a `sip:` URI addressing a host only (e.g. a registrar)
    pub fn sip_host(host: impl Into<String>) -> Self {
        Uri {
            scheme: Scheme::Sip,
            user: None,
            host: host.into(),
            port: None,
            params: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// The URI without its parameter tail, as used in digest computation
    pub fn without_params(&self) -> Uri {
        Uri {
            params: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(params) = &self.params {
            write!(f, ";{}", params)?;
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (scheme, rest) = if let Some(rest) = s.strip_prefix("sips:") {
            (Scheme::Sips, rest)
        } else if let Some(rest) = s.strip_prefix("sip:") {
            (Scheme::Sip, rest)
        } else {
            return Err(Error::InvalidUri(format!("unsupported scheme in {s:?}")));
        };

        let (addr, params) = match rest.split_once(';') {
            Some((addr, params)) => (addr, Some(params.to_string())),
            None => (rest, None),
        };

        let (user, hostport) = match addr.rsplit_once('@') {
            Some((user, hostport)) => {
                if user.is_empty() {
                    return Err(Error::InvalidUri(format!("empty user part in {s:?}")));
                }
                (Some(user.to_string()), hostport)
            }
            None => (None, addr),
        };

        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidUri(format!("invalid port in {s:?}")))?;
                (host, Some(port))
            }
            None => (hostport, None),
        };

        if host.is_empty() {
            return Err(Error::InvalidUri(format!("empty host in {s:?}")));
        }

        Ok(Uri {
            scheme,
            user,
            host: host.to_string(),
            port,
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_uri() {
        let uri: Uri = "sip:alice@example.com:5060".parse().unwrap();
        assert_eq!(uri.scheme, Scheme::Sip);
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, Some(5060));
        assert_eq!(uri.to_string(), "sip:alice@example.com:5060");
    }

    #[test]
    fn test_parse_host_only() {
        let uri: Uri = "sip:sip.example.com".parse().unwrap();
        assert_eq!(uri.user, None);
        assert_eq!(uri.host, "sip.example.com");
        assert_eq!(uri.port, None);
    }

    #[test]
    fn test_parse_sips_and_params() {
        let uri: Uri = "sips:bob@example.net;transport=tcp".parse().unwrap();
        assert_eq!(uri.scheme, Scheme::Sips);
        assert_eq!(uri.params.as_deref(), Some("transport=tcp"));
        assert_eq!(uri.to_string(), "sips:bob@example.net;transport=tcp");
        assert_eq!(uri.without_params().to_string(), "sips:bob@example.net");
    }

    #[test]
    fn test_invalid_uris() {
        assert!("http://example.com".parse::<Uri>().is_err());
        assert!("sip:@example.com".parse::<Uri>().is_err());
        assert!("sip:alice@".parse::<Uri>().is_err());
        assert!("sip:alice@example.com:notaport".parse::<Uri>().is_err());
    }
}
