//! SIP server: UDP listener plus per-request dispatch

use super::builder::ResponseBuilder;
use super::handler::SipHandler;
use super::message::{SipError, SipMessage, SipMethod, SipRequest};
use super::transport::{IncomingMessage, ServerTransaction, UdpServerTransaction, UdpTransport};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

type HandlerMap = Arc<RwLock<HashMap<SipMethod, Arc<dyn SipHandler>>>>;

/// SIP server configuration
#[derive(Debug, Clone)]
pub struct SipServerConfig {
    pub listen: SocketAddr,
    /// Value of the Server header on responses the server generates itself
    pub server_name: String,
}

/// SIP server
pub struct SipServer {
    config: SipServerConfig,
    transport: UdpTransport,
    handlers: HandlerMap,
    local_addr: Option<SocketAddr>,
    tasks: TaskTracker,
}

impl SipServer {
    pub fn new(config: SipServerConfig) -> Self {
        Self {
            transport: UdpTransport::new(config.listen),
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            local_addr: None,
            tasks: TaskTracker::new(),
        }
    }

    pub async fn register_handler(&self, method: SipMethod, handler: Arc<dyn SipHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(method, handler);
        info!("Registered handler for SIP method: {}", method);
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Dispatch loop and in-flight requests
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Wait for in-flight requests to finish after `cancel` has fired
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Bind and start dispatching until `cancel` fires
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<SocketAddr, SipError> {
        info!("Starting SIP server");

        let local_addr = self.transport.start(cancel.clone()).await?;
        let mut rx = self
            .transport
            .take_receiver()
            .ok_or_else(|| SipError::Internal("SIP server already started".to_string()))?;
        let socket = self
            .transport
            .socket()
            .ok_or_else(|| SipError::Internal("UDP socket not bound".to_string()))?;
        self.local_addr = Some(local_addr);

        let handlers = self.handlers.clone();
        let server_name = self.config.server_name.clone();
        let tasks = self.tasks.clone();
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("SIP dispatch loop cancelled");
                        break;
                    }
                    incoming = rx.recv() => {
                        let Some(incoming) = incoming else { break };
                        let handlers = handlers.clone();
                        let socket = socket.clone();
                        let server_name = server_name.clone();
                        tasks.spawn(async move {
                            Self::dispatch(incoming, handlers, socket, &server_name).await;
                        });
                    }
                }
            }
        });

        info!("SIP server started on {}", local_addr);
        Ok(local_addr)
    }

    async fn dispatch(
        incoming: IncomingMessage,
        handlers: HandlerMap,
        socket: Arc<UdpSocket>,
        server_name: &str,
    ) {
        let request = match incoming.message {
            SipMessage::Request(request) => request,
            SipMessage::Response(response) => {
                debug!(
                    "Ignoring stray SIP response {} from {}",
                    response.status_code(),
                    incoming.source
                );
                return;
            }
        };

        let tx = UdpServerTransaction::new(socket, incoming.source);

        let Some(method) = request.method() else {
            warn!(
                "Unsupported SIP method {} from {}",
                request.inner.method, incoming.source
            );
            Self::reply_status(&tx, &request, 501, server_name).await;
            return;
        };
        debug!("Processing SIP request: {} from {}", method, incoming.source);

        let handler = handlers.read().await.get(&method).cloned();
        let Some(handler) = handler else {
            if method != SipMethod::Ack {
                warn!("No handler registered for method: {}", method);
                Self::reply_status(&tx, &request, 501, server_name).await;
            }
            return;
        };

        if let Err(e) = handler.handle_request(request.clone(), &tx).await {
            error!("Handler error for {}: {}", method, e);
            if method != SipMethod::Ack {
                let status = match e {
                    SipError::ParseError(_) | SipError::InvalidMessage(_) => 400,
                    _ => 500,
                };
                Self::reply_status(&tx, &request, status, server_name).await;
            }
        }
    }

    async fn reply_status(
        tx: &dyn ServerTransaction,
        request: &SipRequest,
        status: u16,
        server_name: &str,
    ) {
        match ResponseBuilder::new(status)
            .server(server_name)
            .build_for_request(request)
        {
            Ok(response) => {
                if let Err(e) = tx.respond(response).await {
                    error!("Failed to send {} response: {}", status, e);
                }
            }
            Err(e) => error!("Failed to build {} response: {}", status, e),
        }
    }

    pub fn stop(&mut self) {
        info!("Stopping SIP server");
        self.transport.stop();
        self.local_addr = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Failing;

    #[async_trait]
    impl SipHandler for Failing {
        async fn handle_request(
            &self,
            _request: SipRequest,
            _tx: &dyn ServerTransaction,
        ) -> Result<(), SipError> {
            Err(SipError::Internal("boom".to_string()))
        }
    }

    fn config() -> SipServerConfig {
        SipServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            server_name: "Test-Proxy".to_string(),
        }
    }

    async fn exchange(server_addr: SocketAddr, raw: &str) -> String {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(raw.as_bytes(), server_addr).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let (n, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    fn options(method: &str) -> String {
        format!(
            "{method} sip:host SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5070;branch=z9hG4bK1\r\n\
             From: <sip:ping@host>;tag=1\r\n\
             To: <sip:host>\r\n\
             Call-ID: server-test\r\n\
             CSeq: 1 {method}\r\n\
             Content-Length: 0\r\n\r\n"
        )
    }

    #[tokio::test]
    async fn test_unhandled_method_gets_501() {
        let cancel = CancellationToken::new();
        let mut server = SipServer::new(config());
        let addr = server.start(cancel.clone()).await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));

        let response = exchange(addr, &options("OPTIONS")).await;
        assert!(response.starts_with("SIP/2.0 501"));
        assert!(response.contains("Test-Proxy"));

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_handler_error_gets_500() {
        let cancel = CancellationToken::new();
        let mut server = SipServer::new(config());
        server
            .register_handler(SipMethod::Options, Arc::new(Failing))
            .await;
        let addr = server.start(cancel.clone()).await.unwrap();

        let response = exchange(addr, &options("OPTIONS")).await;
        assert!(response.starts_with("SIP/2.0 500"));

        cancel.cancel();
    }

    struct Slow;

    #[async_trait]
    impl SipHandler for Slow {
        async fn handle_request(
            &self,
            request: SipRequest,
            tx: &dyn ServerTransaction,
        ) -> Result<(), SipError> {
            tokio::time::sleep(Duration::from_millis(150)).await;
            tx.respond(ResponseBuilder::ok().build_for_request(&request)?)
                .await
        }
    }

    #[tokio::test]
    async fn test_drain_lets_in_flight_requests_answer() {
        let cancel = CancellationToken::new();
        let mut server = SipServer::new(config());
        server
            .register_handler(SipMethod::Options, Arc::new(Slow))
            .await;
        let addr = server.start(cancel.clone()).await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(options("OPTIONS").as_bytes(), addr)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        cancel.cancel();
        server.stop();
        timeout(Duration::from_secs(2), server.drain()).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let (n, _) = timeout(Duration::from_millis(200), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("SIP/2.0 200"));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let cancel = CancellationToken::new();
        let mut server = SipServer::new(config());
        server.start(cancel.clone()).await.unwrap();
        assert!(server.start(cancel.clone()).await.is_err());
        cancel.cancel();
    }
}
