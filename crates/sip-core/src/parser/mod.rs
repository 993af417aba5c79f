//! Wire parsing for SIP messages
//!
//! The start line is parsed with nom; the header section is consumed line by
//! line with RFC 3261 folding support. Decoding is strict where it matters
//! for correctness (start line shape, Content-Length vs body) and tolerant
//! where real traffic is sloppy (bare LF line endings, odd whitespace).

mod start_line;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::message::{Message, Request, Response};
use crate::types::header::{HeaderName, Headers};

pub use start_line::{parse_request_line, parse_status_line};

/// Parse a complete SIP message from wire bytes.
///
/// For datagram transports the whole packet is one message. A non-empty body
/// without a Content-Length header is rejected as malformed; a declared
/// length longer than the available bytes is rejected too (a truncated
/// packet), while extra trailing bytes beyond the declared length are
/// dropped, matching how datagram padding is treated.
pub fn parse_message(input: &[u8]) -> Result<Message> {
    let text = std::str::from_utf8(input)
        .map_err(|_| Error::malformed("message is not valid UTF-8"))?;

    let (head, raw_body) = split_head_body(text)?;
    let mut lines = head.lines();
    let start = lines
        .next()
        .ok_or_else(|| Error::malformed("empty message"))?;

    let headers = parse_headers(lines)?;
    let body = extract_body(&headers, raw_body)?;

    if start.starts_with("SIP/") {
        let (status, reason) = parse_status_line(start)?;
        Ok(Message::Response(Response {
            status,
            reason,
            headers,
            body,
        }))
    } else {
        let (method, uri) = parse_request_line(start)?;
        Ok(Message::Request(Request {
            method,
            uri,
            headers,
            body,
        }))
    }
}

/// Split at the blank line separating headers from body.
///
/// CRLF CRLF on the wire, but bare LF LF (and mixes) are accepted.
fn split_head_body(text: &str) -> Result<(&str, &str)> {
    if let Some(pos) = text.find("\r\n\r\n") {
        return Ok((&text[..pos], &text[pos + 4..]));
    }
    if let Some(pos) = text.find("\n\n") {
        return Ok((&text[..pos], &text[pos + 2..]));
    }
    // Header-only message where the final blank line terminates the input
    if text.ends_with("\r\n") || text.ends_with('\n') {
        return Ok((text, ""));
    }
    Err(Error::malformed("missing header/body separator"))
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers> {
    let mut headers = Headers::new();
    for line in lines {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        // Folded continuation line: append to the previous header value
        if line.starts_with(' ') || line.starts_with('\t') {
            match headers.0.last_mut() {
                Some(prev) => {
                    prev.value.push(' ');
                    prev.value.push_str(line.trim());
                    continue;
                }
                None => return Err(Error::malformed("continuation line before any header")),
            }
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::malformed(format!("header line without colon: {line:?}")))?;
        if name.trim().is_empty() {
            return Err(Error::malformed("empty header name"));
        }
        headers.push(HeaderName::parse(name.trim()), value.trim());
    }
    Ok(headers)
}

fn extract_body(headers: &Headers, raw_body: &str) -> Result<Bytes> {
    let raw = raw_body.as_bytes();
    match headers.content_length() {
        Some(len) => {
            if len > raw.len() {
                return Err(Error::malformed(format!(
                    "Content-Length {} exceeds available body of {}",
                    len,
                    raw.len()
                )));
            }
            Ok(Bytes::copy_from_slice(&raw[..len]))
        }
        None if raw.is_empty() => Ok(Bytes::new()),
        None => {
            if headers.get(&HeaderName::ContentLength).is_some() {
                return Err(Error::InvalidHeader(
                    "Content-Length",
                    "not a number".to_string(),
                ));
            }
            Err(Error::malformed("non-empty body without Content-Length"))
        }
    }
}
