//! Fluent builders for SIP requests and responses
//!
//! These cover the messages a user agent core produces: REGISTER, INVITE,
//! ACK, BYE, CANCEL and the responses it must answer with (200 to a BYE).

use bytes::Bytes;

use crate::message::{Request, Response};
use crate::types::header::{name_addr, HeaderName};
use crate::types::method::Method;
use crate::types::status::StatusCode;
use crate::types::uri::Uri;

const DEFAULT_MAX_FORWARDS: u32 = 70;
const USER_AGENT: &str = concat!("sipkit/", env!("CARGO_PKG_VERSION"));

/// Builder for SIP requests
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    pub fn new(method: Method, uri: Uri) -> Self {
        let mut request = Request::new(method, uri);
        request
            .headers
            .push(HeaderName::MaxForwards, DEFAULT_MAX_FORWARDS.to_string());
        request.headers.push(HeaderName::UserAgent, USER_AGENT);
        RequestBuilder { request }
    }

    /// Top Via header: `SIP/2.0/UDP host:port;branch=...`
    pub fn via(mut self, sent_by: &str, branch: &str) -> Self {
        self.request.headers.push(
            HeaderName::Via,
            format!("SIP/2.0/UDP {};branch={}", sent_by, branch),
        );
        self
    }

    /// Raw Via value, used when a request must reuse an existing Via (ACK,
    /// CANCEL).
    pub fn raw_via(mut self, value: &str) -> Self {
        self.request.headers.push(HeaderName::Via, value);
        self
    }

    pub fn from(mut self, display: Option<&str>, uri: &Uri, tag: Option<&str>) -> Self {
        self.request
            .headers
            .push(HeaderName::From, name_addr(display, uri, tag));
        self
    }

    pub fn to(mut self, display: Option<&str>, uri: &Uri, tag: Option<&str>) -> Self {
        self.request
            .headers
            .push(HeaderName::To, name_addr(display, uri, tag));
        self
    }

    /// Raw To value, for requests that must echo a To header exactly (ACK to
    /// a response carries the response's To, tag included).
    pub fn raw_to(mut self, value: &str) -> Self {
        self.request.headers.push(HeaderName::To, value);
        self
    }

    pub fn call_id(mut self, call_id: &str) -> Self {
        self.request.headers.push(HeaderName::CallId, call_id);
        self
    }

    pub fn cseq(mut self, seq: u32) -> Self {
        let method = self.request.method.clone();
        self.request
            .headers
            .push(HeaderName::CSeq, format!("{} {}", seq, method));
        self
    }

    /// CSeq with an explicit method (CANCEL carries the INVITE's method
    /// number but its own method name is CANCEL; ACK mirrors the INVITE
    /// sequence number)
    pub fn cseq_for(mut self, seq: u32, method: &Method) -> Self {
        self.request
            .headers
            .push(HeaderName::CSeq, format!("{} {}", seq, method));
        self
    }

    pub fn contact(mut self, uri: &Uri) -> Self {
        self.request
            .headers
            .push(HeaderName::Contact, format!("<{}>", uri));
        self
    }

    pub fn expires(mut self, seconds: u32) -> Self {
        self.request
            .headers
            .push(HeaderName::Expires, seconds.to_string());
        self
    }

    pub fn authorization(mut self, header: HeaderName, value: &str) -> Self {
        self.request.headers.push(header, value);
        self
    }

    /// Route headers from a dialog's route set, in order
    pub fn routes(mut self, routes: &[Uri]) -> Self {
        for route in routes {
            self.request
                .headers
                .push(HeaderName::Route, format!("<{}>", route));
        }
        self
    }

    pub fn header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.request.headers.push(name, value);
        self
    }

    pub fn body(mut self, content_type: &str, body: Bytes) -> Self {
        self.request
            .headers
            .push(HeaderName::ContentType, content_type);
        self.request.body = body;
        self
    }

    pub fn build(self) -> Request {
        self.request
    }
}

/// Builder for SIP responses
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    response: Response,
}

impl ResponseBuilder {
    pub fn new(status: StatusCode) -> Self {
        ResponseBuilder {
            response: Response::new(status),
        }
    }

    /// Start a response to `request`, copying the headers RFC 3261 Section
    /// 8.2.6 requires to be echoed: Via, From, To, Call-ID, CSeq.
    pub fn response_to(request: &Request, status: StatusCode) -> Self {
        let mut builder = ResponseBuilder::new(status);
        for name in [
            HeaderName::Via,
            HeaderName::From,
            HeaderName::To,
            HeaderName::CallId,
            HeaderName::CSeq,
        ] {
            for value in request.headers.get_all(&name) {
                builder.response.headers.push(name.clone(), value);
            }
        }
        builder
    }

    pub fn to_tag(mut self, tag: &str) -> Self {
        self.response.headers.set_to_tag(tag);
        self
    }

    pub fn header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.response.headers.push(name, value);
        self
    }

    pub fn build(self) -> Response {
        self.response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_message;
    use crate::Message;

    #[test]
    fn test_register_request_shape() {
        let registrar: Uri = "sip:sip.example.com".parse().unwrap();
        let aor: Uri = "sip:alice@sip.example.com".parse().unwrap();
        let contact: Uri = "sip:alice@10.0.0.1:5060".parse().unwrap();
        let request = RequestBuilder::new(Method::Register, registrar.clone())
            .via("10.0.0.1:5060", "z9hG4bKtest")
            .from(None, &aor, Some("ft"))
            .to(None, &aor, None)
            .call_id("reg-call")
            .cseq(1)
            .contact(&contact)
            .expires(3600)
            .build();

        assert_eq!(request.headers.via_branch(), Some("z9hG4bKtest"));
        assert_eq!(request.headers.from_tag(), Some("ft"));
        assert_eq!(request.headers.expires(), Some(3600));
        assert_eq!(request.headers.cseq(), Some((1, Method::Register)));

        // builds a message the parser accepts unchanged
        let reparsed = parse_message(&request.to_bytes()).unwrap();
        assert!(matches!(reparsed, Message::Request(r) if r.method == Method::Register));
    }

    #[test]
    fn test_response_to_echoes_required_headers() {
        let bye = RequestBuilder::new(Method::Bye, "sip:alice@10.0.0.1".parse().unwrap())
            .via("10.0.0.2:5060", "z9hG4bKbye")
            .from(None, &"sip:bob@example.net".parse().unwrap(), Some("bt"))
            .to(None, &"sip:alice@example.com".parse().unwrap(), Some("at"))
            .call_id("call-9")
            .cseq(7)
            .build();

        let ok = ResponseBuilder::response_to(&bye, StatusCode::Ok).build();
        assert_eq!(ok.headers.call_id(), Some("call-9"));
        assert_eq!(ok.headers.cseq(), Some((7, Method::Bye)));
        assert_eq!(ok.headers.via_branch(), Some("z9hG4bKbye"));
        assert_eq!(ok.headers.from_tag(), Some("bt"));
        assert_eq!(ok.headers.to_tag(), Some("at"));
    }
}
