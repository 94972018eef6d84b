//! Outbound trunk registration
//!
//! Keeps this gateway registered with an upstream carrier or PBX. One
//! registrant owns one registration: the Call-ID and From tag stay fixed for
//! its lifetime and every request carries the next CSeq.

use super::auth::{AuthChallenge, AuthorizationHeader};
use super::builder::RequestBuilder;
use super::message::{SipError, SipMethod, SipRequest};
use super::transport::{ClientTransport, TransportProtocol};
use rsip::Header;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Who this gateway registers as
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Host (and optional port) placed in our Contact
    pub contact_hostname: String,
}

/// Where to register
#[derive(Debug, Clone)]
pub struct Destination {
    pub transport: TransportProtocol,
    /// `host:port` of the upstream registrar
    pub proxy_addr: String,
}

impl Destination {
    /// Registrar domain, i.e. `proxy_addr` without its port
    pub fn domain(&self) -> &str {
        match self.proxy_addr.rsplit_once(':') {
            Some((host, port))
                if port.parse::<u16>().is_ok() && (!host.contains(':') || host.starts_with('[')) =>
            {
                host
            }
            _ => &self.proxy_addr,
        }
    }

    async fn resolve(&self) -> Result<SocketAddr, SipError> {
        let target = if self.domain() == self.proxy_addr {
            format!("{}:{}", self.proxy_addr, self.transport.default_port())
        } else {
            self.proxy_addr.clone()
        };
        let addr = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| SipError::TransportError(format!("cannot resolve {}: {}", target, e)))?
            .next()
            .ok_or_else(|| SipError::TransportError(format!("no address for {}", target)));
        addr
    }
}

/// Registration timing
#[derive(Debug, Clone)]
pub struct TrunkConfig {
    /// Expiry requested from the upstream, in seconds
    pub expires: u32,
    /// Wait after a failed attempt
    pub retry_interval: Duration,
}

impl Default for TrunkConfig {
    fn default() -> Self {
        Self {
            expires: 3600,
            retry_interval: Duration::from_secs(30),
        }
    }
}

pub struct TrunkRegistrant {
    transport: Arc<dyn ClientTransport>,
    credentials: Credentials,
    destination: Destination,
    config: TrunkConfig,
    call_id: String,
    from_tag: String,
    cseq: AtomicU32,
}

impl TrunkRegistrant {
    pub fn new(
        transport: Arc<dyn ClientTransport>,
        credentials: Credentials,
        destination: Destination,
        config: TrunkConfig,
    ) -> Self {
        Self {
            call_id: format!("{}@{}", uuid::Uuid::new_v4().simple(), credentials.contact_hostname),
            from_tag: format!("{:08x}", rand::random::<u32>()),
            cseq: AtomicU32::new(0),
            transport,
            credentials,
            destination,
            config,
        }
    }

    fn registrar_uri(&self) -> String {
        format!("sip:{}", self.destination.domain())
    }

    fn build_register(&self, authorization: Option<Header>) -> Result<SipRequest, SipError> {
        let cseq = self.cseq.fetch_add(1, Ordering::SeqCst) + 1;
        let aor = format!(
            "sip:{}@{}",
            self.credentials.username,
            self.destination.domain()
        );
        let transport = self.destination.transport;

        let mut builder = RequestBuilder::new(SipMethod::Register, self.registrar_uri())
            .header(Header::Via(
                format!(
                    "SIP/2.0/{} {};rport;branch=z9hG4bK{}",
                    transport.as_str(),
                    self.transport.local_addr(),
                    uuid::Uuid::new_v4().simple()
                )
                .into(),
            ))
            .header(Header::MaxForwards("70".into()))
            .header(Header::From(format!("<{}>;tag={}", aor, self.from_tag).into()))
            .header(Header::To(format!("<{}>", aor).into()))
            .header(Header::CallId(self.call_id.clone().into()))
            .header(Header::CSeq(format!("{} REGISTER", cseq).into()))
            .header(Header::Contact(
                format!(
                    "<sip:{}@{};transport={}>",
                    self.credentials.username,
                    self.credentials.contact_hostname,
                    transport.as_str().to_ascii_lowercase()
                )
                .into(),
            ))
            .header(Header::Expires(self.config.expires.to_string().into()))
            .header(Header::UserAgent(
                concat!("megaphone/", env!("CARGO_PKG_VERSION")).into(),
            ));

        if let Some(authorization) = authorization {
            builder = builder.header(authorization);
        }

        builder.build()
    }

    /// Run one registration transaction, answering at most one challenge.
    ///
    /// Returns the expiry the upstream granted, in seconds.
    pub async fn register(&self, cancel: &CancellationToken) -> Result<u32, SipError> {
        let destination = self.destination.resolve().await?;
        let mut authorization = None;

        loop {
            let answered = authorization.is_some();
            let request = self.build_register(authorization.take())?;
            debug!(
                "Sending REGISTER (CSeq {}) to {}",
                request.cseq().unwrap_or_default(),
                destination
            );

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SipError::Cancelled),
                response = self.transport.send_request(request, destination) => response?,
            };

            let status = response.status_code();
            match status {
                200..=299 => {
                    let granted = response
                        .contact_expires()
                        .or_else(|| response.expires())
                        .unwrap_or(self.config.expires);
                    info!(
                        "Registered with trunk {} as {} for {}s",
                        self.destination.proxy_addr, self.credentials.username, granted
                    );
                    return Ok(granted);
                }
                401 | 407 if !answered => {
                    let value = response.challenge().ok_or_else(|| {
                        SipError::AuthRejected(format!("{} without a challenge", status))
                    })?;
                    let challenge = AuthChallenge::parse(&value)?;
                    debug!("Trunk challenged us ({}), realm {}", status, challenge.realm);

                    let answer = AuthorizationHeader::answer(
                        &challenge,
                        &self.credentials.username,
                        &self.credentials.password,
                        SipMethod::Register.as_str(),
                        &self.registrar_uri(),
                        1,
                    )
                    .to_header_value();
                    authorization = Some(if status == 407 {
                        Header::ProxyAuthorization(answer.into())
                    } else {
                        Header::Authorization(answer.into())
                    });
                }
                401 | 407 => {
                    return Err(SipError::AuthRejected(
                        "trunk refused our credentials".to_string(),
                    ))
                }
                403 => return Err(SipError::AuthRejected("forbidden by trunk".to_string())),
                other => {
                    return Err(SipError::InvalidMessage(format!(
                        "unexpected REGISTER response {}",
                        other
                    )))
                }
            }
        }
    }

    /// Register and keep refreshing at half the granted expiry until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "Starting trunk registration to {} over {}",
            self.destination.proxy_addr,
            self.destination.transport.as_str()
        );

        loop {
            let wait = match self.register(&cancel).await {
                Ok(granted) => Duration::from_secs(u64::from(granted.max(2)) / 2),
                Err(SipError::Cancelled) => break,
                Err(e) => {
                    warn!(
                        "Trunk registration failed, retrying in {:?}: {}",
                        self.config.retry_interval, e
                    );
                    self.config.retry_interval
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Trunk registration stopped");
    }
}
