//! SIP headers
//!
//! Headers are stored as `(name, raw value)` pairs in wire order. Known
//! headers get typed accessors that parse on demand; unknown headers are
//! preserved verbatim and re-emitted unmodified, since proxies may depend on
//! fields this stack does not interpret.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::method::Method;
use crate::types::uri::Uri;

/// Name of a SIP header
///
/// Known names compare case-insensitively on parse and print their canonical
/// RFC 3261 capitalization. Compact forms (`v`, `f`, `t`, `i`, `m`, `l`) map
/// to their long equivalents on input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeaderName {
    Via,
    From,
    To,
    CallId,
    CSeq,
    Contact,
    ContentLength,
    ContentType,
    Expires,
    MaxForwards,
    Route,
    RecordRoute,
    WwwAuthenticate,
    ProxyAuthenticate,
    Authorization,
    ProxyAuthorization,
    UserAgent,
    /// Any header this stack does not model explicitly
    Other(String),
}

impl HeaderName {
    pub fn as_str(&self) -> &str {
        match self {
            HeaderName::Via => "Via",
            HeaderName::From => "From",
            HeaderName::To => "To",
            HeaderName::CallId => "Call-ID",
            HeaderName::CSeq => "CSeq",
            HeaderName::Contact => "Contact",
            HeaderName::ContentLength => "Content-Length",
            HeaderName::ContentType => "Content-Type",
            HeaderName::Expires => "Expires",
            HeaderName::MaxForwards => "Max-Forwards",
            HeaderName::Route => "Route",
            HeaderName::RecordRoute => "Record-Route",
            HeaderName::WwwAuthenticate => "WWW-Authenticate",
            HeaderName::ProxyAuthenticate => "Proxy-Authenticate",
            HeaderName::Authorization => "Authorization",
            HeaderName::ProxyAuthorization => "Proxy-Authorization",
            HeaderName::UserAgent => "User-Agent",
            HeaderName::Other(name) => name,
        }
    }

    /// Parse a header name, folding case and compact forms
    pub fn parse(name: &str) -> HeaderName {
        match name.to_ascii_lowercase().as_str() {
            "via" | "v" => HeaderName::Via,
            "from" | "f" => HeaderName::From,
            "to" | "t" => HeaderName::To,
            "call-id" | "i" => HeaderName::CallId,
            "cseq" => HeaderName::CSeq,
            "contact" | "m" => HeaderName::Contact,
            "content-length" | "l" => HeaderName::ContentLength,
            "content-type" | "c" => HeaderName::ContentType,
            "expires" => HeaderName::Expires,
            "max-forwards" => HeaderName::MaxForwards,
            "route" => HeaderName::Route,
            "record-route" => HeaderName::RecordRoute,
            "www-authenticate" => HeaderName::WwwAuthenticate,
            "proxy-authenticate" => HeaderName::ProxyAuthenticate,
            "authorization" => HeaderName::Authorization,
            "proxy-authorization" => HeaderName::ProxyAuthorization,
            "user-agent" => HeaderName::UserAgent,
            _ => HeaderName::Other(name.to_string()),
        }
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single header field as it appeared on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: HeaderName,
    pub value: String,
}

impl Header {
    pub fn new(name: HeaderName, value: impl Into<String>) -> Self {
        Header {
            name,
            value: value.into(),
        }
    }
}

/// An ordered collection of headers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(pub Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn push(&mut self, name: HeaderName, value: impl Into<String>) {
        self.0.push(Header::new(name, value));
    }

    /// First value for `name`, if any
    pub fn get(&self, name: &HeaderName) -> Option<&str> {
        self.0
            .iter()
            .find(|h| &h.name == name)
            .map(|h| h.value.as_str())
    }

    /// All values for `name`, in wire order
    pub fn get_all<'a>(&'a self, name: &'a HeaderName) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |h| &h.name == name)
            .map(|h| h.value.as_str())
    }

    /// Replace the first occurrence of `name`, or append if absent
    pub fn set(&mut self, name: HeaderName, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter_mut().find(|h| h.name == name) {
            Some(h) => h.value = value,
            None => self.0.push(Header::new(name, value)),
        }
    }

    pub fn remove_all(&mut self, name: &HeaderName) {
        self.0.retain(|h| &h.name != name);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    // ---- typed accessors ----

    pub fn call_id(&self) -> Option<&str> {
        self.get(&HeaderName::CallId)
    }

    /// CSeq sequence number and method
    pub fn cseq(&self) -> Option<(u32, Method)> {
        let value = self.get(&HeaderName::CSeq)?;
        let (seq, method) = value.trim().split_once(char::is_whitespace)?;
        let seq = seq.parse().ok()?;
        let method = Method::from_str(method.trim()).ok()?;
        Some((seq, method))
    }

    pub fn content_length(&self) -> Option<usize> {
        self.get(&HeaderName::ContentLength)?.trim().parse().ok()
    }

    pub fn expires(&self) -> Option<u32> {
        self.get(&HeaderName::Expires)?.trim().parse().ok()
    }

    /// The branch parameter of the topmost Via header
    pub fn via_branch(&self) -> Option<&str> {
        param_value(self.get(&HeaderName::Via)?, "branch")
    }

    pub fn from_tag(&self) -> Option<&str> {
        param_value(self.get(&HeaderName::From)?, "tag")
    }

    pub fn to_tag(&self) -> Option<&str> {
        param_value(self.get(&HeaderName::To)?, "tag")
    }

    /// URI inside the From header's name-addr
    pub fn from_uri(&self) -> Option<Uri> {
        addr_uri(self.get(&HeaderName::From)?)
    }

    /// URI inside the To header's name-addr
    pub fn to_uri(&self) -> Option<Uri> {
        addr_uri(self.get(&HeaderName::To)?)
    }

    /// URI of the first Contact header
    pub fn contact_uri(&self) -> Option<Uri> {
        addr_uri(self.get(&HeaderName::Contact)?)
    }

    /// URIs of all Record-Route headers, in wire order
    pub fn record_routes(&self) -> Vec<Uri> {
        self.get_all(&HeaderName::RecordRoute)
            .flat_map(|value| value.split(','))
            .filter_map(addr_uri)
            .collect()
    }

    /// Append a tag parameter to the To header if it has none
    pub fn set_to_tag(&mut self, tag: &str) {
        if self.to_tag().is_some() {
            return;
        }
        if let Some(h) = self.0.iter_mut().find(|h| h.name == HeaderName::To) {
            h.value = format!("{};tag={}", h.value, tag);
        }
    }
}

/// Extract `;name=value` from a header value
fn param_value<'a>(header_value: &'a str, name: &str) -> Option<&'a str> {
    for param in header_value.split(';').skip(1) {
        let param = param.trim();
        if let Some((key, value)) = param.split_once('=') {
            if key.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim().trim_matches('"'));
            }
        }
    }
    None
}

/// Extract the URI from a name-addr or addr-spec header value
///
/// Handles both `"Alice" <sip:alice@example.com>;tag=x` and the bare
/// `sip:alice@example.com;tag=x` form. In the bare form parameters belong to
/// the header, not the URI, so the tail is cut before parsing.
fn addr_uri(value: &str) -> Option<Uri> {
    let value = value.trim();
    if let (Some(start), Some(end)) = (value.find('<'), value.find('>')) {
        if start < end {
            return value[start + 1..end].parse().ok();
        }
        return None;
    }
    let bare = value.split(';').next()?.split(',').next()?.trim();
    bare.parse().ok()
}

/// Render a name-addr header value: optional display name, URI, optional tag
pub fn name_addr(display: Option<&str>, uri: &Uri, tag: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(display) = display {
        out.push('"');
        out.push_str(display);
        out.push_str("\" ");
    }
    out.push('<');
    out.push_str(&uri.to_string());
    out.push('>');
    if let Some(tag) = tag {
        out.push_str(";tag=");
        out.push_str(tag);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_name_parse() {
        assert_eq!(HeaderName::parse("VIA"), HeaderName::Via);
        assert_eq!(HeaderName::parse("call-id"), HeaderName::CallId);
        assert_eq!(HeaderName::parse("i"), HeaderName::CallId);
        assert_eq!(
            HeaderName::parse("X-Custom"),
            HeaderName::Other("X-Custom".to_string())
        );
    }

    #[test]
    fn test_cseq_accessor() {
        let mut headers = Headers::new();
        headers.push(HeaderName::CSeq, "42 INVITE");
        assert_eq!(headers.cseq(), Some((42, Method::Invite)));
    }

    #[test]
    fn test_tag_extraction() {
        let mut headers = Headers::new();
        headers.push(HeaderName::From, "\"Alice\" <sip:alice@example.com>;tag=abc123");
        headers.push(HeaderName::To, "<sip:bob@example.net>");
        assert_eq!(headers.from_tag(), Some("abc123"));
        assert_eq!(headers.to_tag(), None);

        headers.set_to_tag("xyz");
        assert_eq!(headers.to_tag(), Some("xyz"));
        // already tagged: a second set is a no-op
        headers.set_to_tag("other");
        assert_eq!(headers.to_tag(), Some("xyz"));
    }

    #[test]
    fn test_addr_uri_forms() {
        assert_eq!(
            addr_uri("\"Bob\" <sip:bob@example.net:5080>;tag=1").unwrap().to_string(),
            "sip:bob@example.net:5080"
        );
        assert_eq!(
            addr_uri("sip:bob@example.net;tag=1").unwrap().to_string(),
            "sip:bob@example.net"
        );
        assert!(addr_uri(">broken<").is_none());
    }

    #[test]
    fn test_via_branch() {
        let mut headers = Headers::new();
        headers.push(
            HeaderName::Via,
            "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKabc",
        );
        assert_eq!(headers.via_branch(), Some("z9hG4bKabc"));
    }

    #[test]
    fn test_record_routes() {
        let mut headers = Headers::new();
        headers.push(HeaderName::RecordRoute, "<sip:p1.example.com;lr>");
        headers.push(HeaderName::RecordRoute, "<sip:p2.example.com;lr>, <sip:p3.example.com;lr>");
        let routes = headers.record_routes();
        assert_eq!(routes.len(), 3);
        assert_eq!(routes[0].host, "p1.example.com");
        assert_eq!(routes[2].host, "p3.example.com");
    }
}
