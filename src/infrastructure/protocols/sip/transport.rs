//! SIP transport layer
//!
//! The proxy only sees two seams: a [`ServerTransaction`] to answer an
//! inbound request, and a [`ClientTransport`] to run an outbound request to
//! its final response. Both are implemented over UDP here.

use super::message::{SipError, SipMessage, SipRequest, SipResponse};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Tls,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Tls => "TLS",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportProtocol::Udp | TransportProtocol::Tcp => 5060,
            TransportProtocol::Tls => 5061,
        }
    }
}

impl FromStr for TransportProtocol {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportProtocol::Udp),
            "tcp" => Ok(TransportProtocol::Tcp),
            "tls" => Ok(TransportProtocol::Tls),
            other => Err(SipError::TransportError(format!(
                "Unknown transport: {}",
                other
            ))),
        }
    }
}

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy)]
pub struct SipTimers {
    /// T1: RTT Estimate (default 500ms)
    pub t1: Duration,
    /// T2: Maximum retransmit interval (default 4s)
    pub t2: Duration,
}

impl SipTimers {
    /// Timer F: how long a non-INVITE client transaction waits for a final response
    pub fn transaction_timeout(&self) -> Duration {
        self.t1 * 64
    }
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
        }
    }
}

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
}

/// Server side of a transaction: lets a handler answer the request
#[async_trait]
pub trait ServerTransaction: Send + Sync {
    async fn respond(&self, response: SipResponse) -> Result<(), SipError>;

    /// Where the request came from
    fn source(&self) -> SocketAddr;
}

/// Client side: send a request and wait for its final response
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Address requests are sent from, used for Via and Contact
    fn local_addr(&self) -> SocketAddr;

    async fn send_request(
        &self,
        request: SipRequest,
        destination: SocketAddr,
    ) -> Result<SipResponse, SipError>;
}

/// UDP listener feeding inbound messages into a channel
pub struct UdpTransport {
    bind_addr: SocketAddr,
    socket: Option<Arc<UdpSocket>>,
    tx: mpsc::Sender<IncomingMessage>,
    rx: Option<mpsc::Receiver<IncomingMessage>>,
}

impl UdpTransport {
    pub fn new(bind_addr: SocketAddr) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        Self {
            bind_addr,
            socket: None,
            tx,
            rx: Some(rx),
        }
    }

    /// Bind the socket and start receiving until `cancel` fires
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<SocketAddr, SipError> {
        info!("Starting UDP transport on {}", self.bind_addr);

        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| SipError::TransportError(e.to_string()))?;

        info!("UDP transport listening on {}", local_addr);

        let socket = Arc::new(socket);
        self.socket = Some(socket.clone());

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!("UDP receive loop cancelled"),
                _ = Self::receive_loop(socket, tx) => {}
            }
        });

        Ok(local_addr)
    }

    pub fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.clone()
    }

    /// Take the inbound message stream. Only the first call gets it.
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<IncomingMessage>> {
        self.rx.take()
    }

    pub fn stop(&mut self) {
        info!("Stopping UDP transport");
        self.socket = None;
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingMessage>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);

                    // Keep-alive CRLFs
                    if buf[..size].iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            let incoming = IncomingMessage {
                                message,
                                source,
                            };

                            if let Err(e) = tx.send(incoming).await {
                                error!("Failed to send incoming message to channel: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    // ICMP port unreachable surfaces here on some platforms
                    warn!("Failed to receive UDP packet: {}", e);
                }
            }
        }
    }
}

/// Answers a request back to the datagram source
pub struct UdpServerTransaction {
    socket: Arc<UdpSocket>,
    destination: SocketAddr,
}

impl UdpServerTransaction {
    pub fn new(socket: Arc<UdpSocket>, destination: SocketAddr) -> Self {
        Self {
            socket,
            destination,
        }
    }
}

#[async_trait]
impl ServerTransaction for UdpServerTransaction {
    async fn respond(&self, response: SipResponse) -> Result<(), SipError> {
        let data = response.to_bytes();
        debug!(
            "Sending {} ({} bytes) to {} via UDP",
            response.status_code(),
            data.len(),
            self.destination
        );

        self.socket
            .send_to(&data, self.destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;
        Ok(())
    }

    fn source(&self) -> SocketAddr {
        self.destination
    }
}

/// Non-INVITE client transactions over a dedicated UDP socket.
///
/// Transactions are run one at a time; responses that do not match the
/// outstanding Call-ID and CSeq are discarded.
pub struct UdpClientTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    timers: SipTimers,
    in_flight: Mutex<()>,
}

impl UdpClientTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self, SipError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| SipError::TransportError(e.to_string()))?;

        Ok(Self {
            socket,
            local_addr,
            timers: SipTimers::default(),
            in_flight: Mutex::new(()),
        })
    }

    pub fn with_timers(mut self, timers: SipTimers) -> Self {
        self.timers = timers;
        self
    }

    fn matches(request: &SipRequest, response: &SipResponse) -> bool {
        let cseq_matches = match (request.cseq(), response.cseq()) {
            (Some(sent), Some((received, method))) => {
                sent == received && method.eq_ignore_ascii_case(&request.inner.method.to_string())
            }
            _ => false,
        };
        cseq_matches && request.call_id() == response.call_id()
    }
}

#[async_trait]
impl ClientTransport for UdpClientTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send_request(
        &self,
        request: SipRequest,
        destination: SocketAddr,
    ) -> Result<SipResponse, SipError> {
        let _guard = self.in_flight.lock().await;
        let data = request.to_bytes();
        let deadline = Instant::now() + self.timers.transaction_timeout();
        let mut interval = self.timers.t1;
        let mut buf = vec![0u8; 65535];

        debug!("Sending {} bytes to {} via UDP", data.len(), destination);
        self.socket
            .send_to(&data, destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;

        let mut retransmit_at = Instant::now() + interval;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(SipError::Timeout(format!(
                    "response from {}",
                    destination
                )));
            }

            let wait = retransmit_at.min(deadline) - now;
            match tokio::time::timeout(wait, self.socket.recv_from(&mut buf)).await {
                Ok(Ok((size, source))) => {
                    let response = match SipMessage::parse(&buf[..size]) {
                        Ok(SipMessage::Response(response)) => response,
                        Ok(SipMessage::Request(_)) => {
                            debug!("Ignoring request from {} on client socket", source);
                            continue;
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                            continue;
                        }
                    };

                    if !Self::matches(&request, &response) {
                        debug!("Discarding stray response from {}", source);
                        continue;
                    }

                    if response.is_provisional() {
                        debug!("Provisional {} from {}", response.status_code(), source);
                        interval = self.timers.t2;
                        retransmit_at = Instant::now() + interval;
                        continue;
                    }

                    return Ok(response);
                }
                Ok(Err(e)) => {
                    return Err(SipError::TransportError(format!(
                        "Failed to receive UDP packet: {}",
                        e
                    )));
                }
                Err(_) => {
                    if Instant::now() >= deadline {
                        continue;
                    }
                    debug!("Retransmitting request to {}", destination);
                    self.socket.send_to(&data, destination).await.map_err(|e| {
                        SipError::TransportError(format!("Failed to send UDP packet: {}", e))
                    })?;
                    interval = (interval * 2).min(self.timers.t2);
                    retransmit_at = Instant::now() + interval;
                }
            }
        }
    }
}

/// Records responses instead of sending them
#[cfg(test)]
pub(crate) struct RecordingTransaction {
    source: SocketAddr,
    pub responses: parking_lot::Mutex<Vec<SipResponse>>,
    fail: bool,
}

#[cfg(test)]
impl RecordingTransaction {
    pub fn new() -> Self {
        Self {
            source: "127.0.0.1:5060".parse().unwrap(),
            responses: parking_lot::Mutex::new(Vec::new()),
            fail: false,
        }
    }

    /// A transaction whose every send fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn status_codes(&self) -> Vec<u16> {
        self.responses.lock().iter().map(|r| r.status_code()).collect()
    }

    pub fn last(&self) -> SipResponse {
        self.responses.lock().last().cloned().unwrap()
    }
}

#[cfg(test)]
#[async_trait]
impl ServerTransaction for RecordingTransaction {
    async fn respond(&self, response: SipResponse) -> Result<(), SipError> {
        if self.fail {
            return Err(SipError::TransportError("send failed".to_string()));
        }
        self.responses.lock().push(response);
        Ok(())
    }

    fn source(&self) -> SocketAddr {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::builder::ResponseBuilder;

    const OPTIONS: &[u8] = b"OPTIONS sip:pbx.example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP 127.0.0.1:5070;branch=z9hG4bKopt1\r\n\
        From: <sip:ping@example.com>;tag=77\r\n\
        To: <sip:pbx.example.com>\r\n\
        Call-ID: transport-test\r\n\
        CSeq: 7 OPTIONS\r\n\
        Content-Length: 0\r\n\r\n";

    #[tokio::test]
    async fn test_udp_transport_start() {
        let mut transport = UdpTransport::new("127.0.0.1:0".parse().unwrap());
        let cancel = CancellationToken::new();

        let local_addr = transport.start(cancel.clone()).await.unwrap();
        assert_ne!(local_addr.port(), 0);
        assert!(transport.take_receiver().is_some());
        assert!(transport.take_receiver().is_none());

        cancel.cancel();
        transport.stop();
    }

    #[test]
    fn test_transport_protocol_from_str() {
        assert_eq!("udp".parse::<TransportProtocol>().unwrap(), TransportProtocol::Udp);
        assert_eq!("TLS".parse::<TransportProtocol>().unwrap().default_port(), 5061);
        assert!("sctp".parse::<TransportProtocol>().is_err());
    }

    #[tokio::test]
    async fn test_client_transport_skips_provisional() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let client = UdpClientTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (size, from) = peer.recv_from(&mut buf).await.unwrap();
            let request = SipRequest::parse(&buf[..size]).unwrap();

            let trying = ResponseBuilder::new(100).build_for_request(&request).unwrap();
            peer.send_to(&trying.to_bytes(), from).await.unwrap();
            let ok = ResponseBuilder::ok().build_for_request(&request).unwrap();
            peer.send_to(&ok.to_bytes(), from).await.unwrap();
        });

        let request = SipRequest::parse(OPTIONS).unwrap();
        let response = client.send_request(request, peer_addr).await.unwrap();
        assert_eq!(response.status_code(), 200);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_transport_times_out() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpClientTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
            .with_timers(SipTimers {
                t1: Duration::from_millis(5),
                t2: Duration::from_millis(20),
            });

        let request = SipRequest::parse(OPTIONS).unwrap();
        let result = client
            .send_request(request, peer.local_addr().unwrap())
            .await;
        assert!(matches!(result, Err(SipError::Timeout(_))));
    }
}
