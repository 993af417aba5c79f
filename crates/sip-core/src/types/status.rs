//! SIP status codes (RFC 3261 Section 21)

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A SIP response status code
///
/// Codes a user agent commonly handles get their own variant; every other
/// valid code (100..=699) is carried as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Trying,
    Ringing,
    SessionProgress,
    Ok,
    Accepted,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    ProxyAuthenticationRequired,
    RequestTimeout,
    TemporarilyUnavailable,
    CallTransactionDoesNotExist,
    BusyHere,
    RequestTerminated,
    ServerInternalError,
    NotImplemented,
    ServiceUnavailable,
    Decline,
    /// Any other valid status code
    Other(u16),
}

impl StatusCode {
    /// Construct from the numeric wire value.
    pub fn from_u16(code: u16) -> Result<Self, Error> {
        if !(100..=699).contains(&code) {
            return Err(Error::InvalidStatusCode(code));
        }
        Ok(match code {
            100 => StatusCode::Trying,
            180 => StatusCode::Ringing,
            183 => StatusCode::SessionProgress,
            200 => StatusCode::Ok,
            202 => StatusCode::Accepted,
            400 => StatusCode::BadRequest,
            401 => StatusCode::Unauthorized,
            403 => StatusCode::Forbidden,
            404 => StatusCode::NotFound,
            407 => StatusCode::ProxyAuthenticationRequired,
            408 => StatusCode::RequestTimeout,
            480 => StatusCode::TemporarilyUnavailable,
            481 => StatusCode::CallTransactionDoesNotExist,
            486 => StatusCode::BusyHere,
            487 => StatusCode::RequestTerminated,
            500 => StatusCode::ServerInternalError,
            501 => StatusCode::NotImplemented,
            503 => StatusCode::ServiceUnavailable,
            603 => StatusCode::Decline,
            other => StatusCode::Other(other),
        })
    }

    /// Numeric wire value
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Trying => 100,
            StatusCode::Ringing => 180,
            StatusCode::SessionProgress => 183,
            StatusCode::Ok => 200,
            StatusCode::Accepted => 202,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::ProxyAuthenticationRequired => 407,
            StatusCode::RequestTimeout => 408,
            StatusCode::TemporarilyUnavailable => 480,
            StatusCode::CallTransactionDoesNotExist => 481,
            StatusCode::BusyHere => 486,
            StatusCode::RequestTerminated => 487,
            StatusCode::ServerInternalError => 500,
            StatusCode::NotImplemented => 501,
            StatusCode::ServiceUnavailable => 503,
            StatusCode::Decline => 603,
            StatusCode::Other(code) => *code,
        }
    }

    /// Default reason phrase for this code
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Trying => "Trying",
            StatusCode::Ringing => "Ringing",
            StatusCode::SessionProgress => "Session Progress",
            StatusCode::Ok => "OK",
            StatusCode::Accepted => "Accepted",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::ProxyAuthenticationRequired => "Proxy Authentication Required",
            StatusCode::RequestTimeout => "Request Timeout",
            StatusCode::TemporarilyUnavailable => "Temporarily Unavailable",
            StatusCode::CallTransactionDoesNotExist => "Call/Transaction Does Not Exist",
            StatusCode::BusyHere => "Busy Here",
            StatusCode::RequestTerminated => "Request Terminated",
            StatusCode::ServerInternalError => "Server Internal Error",
            StatusCode::NotImplemented => "Not Implemented",
            StatusCode::ServiceUnavailable => "Service Unavailable",
            StatusCode::Decline => "Decline",
            StatusCode::Other(_) => "",
        }
    }

    /// 1xx
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.as_u16())
    }

    /// 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.as_u16())
    }

    /// 3xx and above (final non-success)
    pub fn is_failure(&self) -> bool {
        self.as_u16() >= 300
    }

    /// 401 or 407
    pub fn is_auth_challenge(&self) -> bool {
        matches!(
            self,
            StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
        )
    }
}

// Display writes the numeric form; the reason phrase is a separate field on
// Response so a parsed phrase survives re-encoding.
impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u16_known() {
        assert_eq!(StatusCode::from_u16(200).unwrap(), StatusCode::Ok);
        assert_eq!(StatusCode::from_u16(487).unwrap(), StatusCode::RequestTerminated);
        assert_eq!(StatusCode::from_u16(603).unwrap(), StatusCode::Decline);
    }

    #[test]
    fn test_from_u16_other() {
        let code = StatusCode::from_u16(488).unwrap();
        assert_eq!(code, StatusCode::Other(488));
        assert_eq!(code.as_u16(), 488);
    }

    #[test]
    fn test_from_u16_out_of_range() {
        assert!(StatusCode::from_u16(99).is_err());
        assert!(StatusCode::from_u16(700).is_err());
    }

    #[test]
    fn test_classes() {
        assert!(StatusCode::Ringing.is_provisional());
        assert!(StatusCode::Ok.is_success());
        assert!(StatusCode::BusyHere.is_failure());
        assert!(StatusCode::Unauthorized.is_auth_challenge());
        assert!(StatusCode::ProxyAuthenticationRequired.is_auth_challenge());
        assert!(!StatusCode::Forbidden.is_auth_challenge());
    }
}
