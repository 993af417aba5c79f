//! SIP request and response messages and their wire encoding

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::header::{HeaderName, Headers};
use crate::types::method::Method;
use crate::types::status::StatusCode;
use crate::types::uri::Uri;

/// SIP protocol version token, always `SIP/2.0` on the wire
pub const SIP_VERSION: &str = "SIP/2.0";

/// A SIP request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Request {
            method,
            uri,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Encode to wire bytes with CRLF line endings and a correct
    /// Content-Length.
    pub fn to_bytes(&self) -> Bytes {
        encode(
            &format!("{} {} {}", self.method, self.uri, SIP_VERSION),
            &self.headers,
            &self.body,
        )
    }
}

/// A SIP response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            reason: status.reason_phrase().to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        encode(
            &format!("{} {} {}", SIP_VERSION, self.status, self.reason),
            &self.headers,
            &self.body,
        )
    }
}

/// Either a request or a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn headers(&self) -> &Headers {
        match self {
            Message::Request(req) => &req.headers,
            Message::Response(resp) => &resp.headers,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Message::Request(req) => req.to_bytes(),
            Message::Response(resp) => resp.to_bytes(),
        }
    }

    /// Short description for log lines
    pub fn summary(&self) -> String {
        match self {
            Message::Request(req) => format!("{} {}", req.method, req.uri),
            Message::Response(resp) => format!("{} {}", resp.status, resp.reason),
        }
    }
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Message::Request(req)
    }
}

impl From<Response> for Message {
    fn from(resp: Response) -> Self {
        Message::Response(resp)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

// Content-Length is authoritative at encode time: whatever the headers held,
// the emitted value matches the actual body.
fn encode(start_line: &str, headers: &Headers, body: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(start_line.len() + 2 + headers.0.len() * 32 + body.len() + 64);
    out.extend_from_slice(start_line.as_bytes());
    out.extend_from_slice(b"\r\n");

    let mut wrote_content_length = false;
    for header in headers.iter() {
        if header.name == HeaderName::ContentLength {
            if wrote_content_length {
                continue;
            }
            wrote_content_length = true;
            out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
            continue;
        }
        out.extend_from_slice(header.name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(header.value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !wrote_content_length {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }

    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    Bytes::from(out)
}
