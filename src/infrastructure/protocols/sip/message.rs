//! SIP message types and parsing

use bytes::Bytes;
use rsip::headers::UntypedHeader;
use rsip::{Header, Headers, Method, Request, Response};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Authentication challenge required")]
    AuthChallengeRequired,

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// SIP method types handled by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        match method {
            Method::Register => Some(SipMethod::Register),
            Method::Invite => Some(SipMethod::Invite),
            Method::Ack => Some(SipMethod::Ack),
            Method::Cancel => Some(SipMethod::Cancel),
            Method::Bye => Some(SipMethod::Bye),
            Method::Options => Some(SipMethod::Options),
            _ => None,
        }
    }

    pub fn to_rsip(&self) -> Method {
        match self {
            SipMethod::Register => Method::Register,
            SipMethod::Invite => Method::Invite,
            SipMethod::Ack => Method::Ack,
            SipMethod::Cancel => Method::Cancel,
            SipMethod::Bye => Method::Bye,
            SipMethod::Options => Method::Options,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Extract a `;name=value` parameter from a header value.
///
/// Parameters inside `<...>` belong to the URI and are skipped.
pub fn header_param(value: &str, name: &str) -> Option<String> {
    let params = match value.rfind('>') {
        Some(end) => &value[end + 1..],
        None => value,
    };
    params.split(';').skip(1).find_map(|param| {
        let (key, val) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| val.trim().trim_matches('"').to_string())
    })
}

/// Strip the display name and angle brackets from a name-addr value
pub fn addr_spec(value: &str) -> String {
    match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => value[start + 1..end].trim().to_string(),
        _ => value.split(';').next().unwrap_or(value).trim().to_string(),
    }
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn call_id(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::CallId(cid) => Some(cid.value().trim().to_string()),
            _ => None,
        })
    }

    /// Address-of-record from the From header
    pub fn from_uri(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::From(from) => Some(addr_spec(from.value())),
            _ => None,
        })
    }

    /// Address-of-record from the To header
    pub fn to_uri(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::To(to) => Some(addr_spec(to.value())),
            _ => None,
        })
    }

    pub fn from_tag(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::From(from) => header_param(from.value(), "tag"),
            _ => None,
        })
    }

    pub fn to_tag(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::To(to) => header_param(to.value(), "tag"),
            _ => None,
        })
    }

    /// Raw Contact header value
    pub fn contact(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::Contact(contact) => Some(contact.value().trim().to_string()),
            _ => None,
        })
    }

    pub fn expires(&self) -> Option<u32> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::Expires(exp) => exp.value().trim().parse().ok(),
            _ => None,
        })
    }

    /// Value of the Authorization (or Proxy-Authorization) header
    pub fn authorization(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::Authorization(auth) => Some(auth.value().to_string()),
            Header::ProxyAuthorization(auth) => Some(auth.value().to_string()),
            _ => None,
        })
    }

    pub fn cseq(&self) -> Option<u32> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::CSeq(cseq) => cseq.value().split_whitespace().next()?.parse().ok(),
            _ => None,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code() < 200
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn call_id(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::CallId(cid) => Some(cid.value().trim().to_string()),
            _ => None,
        })
    }

    /// CSeq number and method
    pub fn cseq(&self) -> Option<(u32, String)> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::CSeq(cseq) => {
                let mut parts = cseq.value().split_whitespace();
                let seq = parts.next()?.parse().ok()?;
                let method = parts.next()?.to_string();
                Some((seq, method))
            }
            _ => None,
        })
    }

    pub fn expires(&self) -> Option<u32> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::Expires(exp) => exp.value().trim().parse().ok(),
            _ => None,
        })
    }

    /// `expires` parameter of the first Contact header
    pub fn contact_expires(&self) -> Option<u32> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::Contact(contact) => header_param(contact.value(), "expires")?.parse().ok(),
            _ => None,
        })
    }

    /// Digest challenge from WWW-Authenticate or Proxy-Authenticate
    pub fn challenge(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::WwwAuthenticate(auth) => Some(auth.value().to_string()),
            Header::ProxyAuthenticate(auth) => Some(auth.value().to_string()),
            Header::Other(name, value)
                if name.eq_ignore_ascii_case("WWW-Authenticate")
                    || name.eq_ignore_ascii_case("Proxy-Authenticate") =>
            {
                Some(value.to_string())
            }
            _ => None,
        })
    }

    pub fn server(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::Server(server) => Some(server.value().to_string()),
            _ => None,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        match rsip::SipMessage::try_from(data)? {
            rsip::SipMessage::Request(request) => Ok(SipMessage::Request(SipRequest::new(request))),
            rsip::SipMessage::Response(response) => {
                Ok(SipMessage::Response(SipResponse::new(response)))
            }
        }
    }
}
