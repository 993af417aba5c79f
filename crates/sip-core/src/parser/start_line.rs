//! nom parsers for the SIP request line and status line
//!
//! ABNF (RFC 3261 Section 7):
//! Request-Line = Method SP Request-URI SP SIP-Version
//! Status-Line  = SIP-Version SP Status-Code SP Reason-Phrase
//! Status-Code  = 3DIGIT

use std::str::FromStr;

use nom::{
    bytes::complete::{tag, take_till, take_till1},
    character::complete::{char, digit1},
    combinator::map_res,
    sequence::tuple,
    IResult,
};

use crate::error::{Error, Result};
use crate::message::SIP_VERSION;
use crate::types::method::Method;
use crate::types::status::StatusCode;
use crate::types::uri::Uri;

fn method_token(input: &str) -> IResult<&str, Method> {
    map_res(take_till1(|c| c == ' '), Method::from_str)(input)
}

fn status_code(input: &str) -> IResult<&str, StatusCode> {
    map_res(digit1, |digits: &str| -> Result<StatusCode> {
        if digits.len() != 3 {
            return Err(Error::malformed("status code must be 3 digits"));
        }
        let code = digits
            .parse::<u16>()
            .map_err(|_| Error::malformed("status code is not a number"))?;
        StatusCode::from_u16(code)
    })(input)
}

/// Parse `INVITE sip:bob@example.net SIP/2.0`
pub fn parse_request_line(line: &str) -> Result<(Method, Uri)> {
    let parsed: IResult<&str, (Method, char, &str, char, &str)> = tuple((
        method_token,
        char(' '),
        take_till1(|c| c == ' '),
        char(' '),
        tag(SIP_VERSION),
    ))(line);

    match parsed {
        Ok(("", (method, _, uri, _, _))) => {
            let uri = uri.parse()?;
            Ok((method, uri))
        }
        _ => Err(Error::malformed(format!("invalid request line: {line:?}"))),
    }
}

/// Parse `SIP/2.0 200 OK`; the reason phrase may be empty
pub fn parse_status_line(line: &str) -> Result<(StatusCode, String)> {
    let parsed: IResult<&str, (&str, char, StatusCode, char, &str)> = tuple((
        tag(SIP_VERSION),
        char(' '),
        status_code,
        char(' '),
        take_till(|c| c == '\r' || c == '\n'),
    ))(line);

    match parsed {
        Ok(("", (_, _, status, _, reason))) => Ok((status, reason.to_string())),
        _ => Err(Error::malformed(format!("invalid status line: {line:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line() {
        let (method, uri) = parse_request_line("REGISTER sip:sip.example.com SIP/2.0").unwrap();
        assert_eq!(method, Method::Register);
        assert_eq!(uri.to_string(), "sip:sip.example.com");
    }

    #[test]
    fn test_request_line_rejects_bad_version() {
        assert!(parse_request_line("INVITE sip:a@b.c HTTP/1.1").is_err());
        assert!(parse_request_line("INVITE sip:a@b.c").is_err());
        assert!(parse_request_line("INVITE  sip:a@b.c SIP/2.0").is_err());
    }

    #[test]
    fn test_status_line() {
        let (status, reason) = parse_status_line("SIP/2.0 200 OK").unwrap();
        assert_eq!(status, StatusCode::Ok);
        assert_eq!(reason, "OK");
    }

    #[test]
    fn test_status_line_empty_reason() {
        let (status, reason) = parse_status_line("SIP/2.0 501 ").unwrap();
        assert_eq!(status, StatusCode::NotImplemented);
        assert_eq!(reason, "");
    }

    #[test]
    fn test_status_line_rejects_bad_code() {
        assert!(parse_status_line("SIP/2.0 20 OK").is_err());
        assert!(parse_status_line("SIP/2.0 2000 OK").is_err());
        assert!(parse_status_line("SIP/2.0 ABC OK").is_err());
        assert!(parse_status_line("HTTP/1.1 200 OK").is_err());
    }

    #[test]
    fn test_status_line_multi_word_reason() {
        let (status, reason) = parse_status_line("SIP/2.0 487 Request Terminated").unwrap();
        assert_eq!(status, StatusCode::RequestTerminated);
        assert_eq!(reason, "Request Terminated");
    }
}
