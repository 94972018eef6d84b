//! SIP message builder utilities

use super::message::{header_param, SipError, SipMethod, SipRequest, SipResponse};
use rsip::headers::UntypedHeader;
use rsip::{Header, Headers, Request, Response, StatusCode, Uri, Version};

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    headers: Vec<Header>,
    server: Option<String>,
    to_tag: Option<String>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
            server: None,
            to_tag: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn unauthorized() -> Self {
        Self::new(401)
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    /// Identify the responding server
    pub fn server(mut self, name: &str) -> Self {
        self.server = Some(name.to_string());
        self
    }

    /// Tag the To header when the request does not carry one yet
    pub fn to_tag(mut self, tag: &str) -> Self {
        self.to_tag = Some(tag.to_string());
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut headers = Vec::with_capacity(self.headers.len() + 8);

        // Copy essential headers from request
        for header in request.headers().iter() {
            match header {
                Header::To(to) => match &self.to_tag {
                    Some(tag) if header_param(to.value(), "tag").is_none() => {
                        headers.push(Header::To(format!("{};tag={}", to.value(), tag).into()));
                    }
                    _ => headers.push(header.clone()),
                },
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                    headers.push(header.clone());
                }
                _ => {}
            }
        }

        headers.extend(self.headers);

        if let Some(server) = self.server {
            headers.push(Header::Server(server.into()));
        }

        headers.push(Header::ContentLength("0".into()));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(headers),
            body: Vec::new(),
            version: Version::V2,
        };

        Ok(SipResponse::new(response))
    }
}

/// Build an outgoing SIP request
pub struct RequestBuilder {
    method: SipMethod,
    uri: String,
    headers: Vec<Header>,
}

impl RequestBuilder {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn build(mut self) -> Result<SipRequest, SipError> {
        let uri = Uri::try_from(self.uri.as_str())?;

        if !self
            .headers
            .iter()
            .any(|h| matches!(h, Header::ContentLength(_)))
        {
            self.headers.push(Header::ContentLength("0".into()));
        }

        let request = Request {
            method: self.method.to_rsip(),
            uri,
            version: Version::V2,
            headers: Headers::from(self.headers),
            body: Vec::new(),
        };

        Ok(SipRequest::new(request))
    }
}
