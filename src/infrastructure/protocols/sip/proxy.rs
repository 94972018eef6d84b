//! Inbound registrar/proxy: the SIP server with every handler wired in

use super::auth::DigestAuth;
use super::call_handler::{
    AckHandler, AdmissionPolicy, ByeHandler, CallControl, CancelHandler, InviteHandler,
    OptionsHandler,
};
use super::message::{SipError, SipMethod};
use super::registrar::{Registrar, RegistrarConfig};
use super::reporter::ErrorReporter;
use super::server::{SipServer, SipServerConfig};
use super::transport::SipTimers;
use crate::domain::CallQueue;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub server_name: String,
    pub realm: String,
    pub registrar: RegistrarConfig,
    pub admission: AdmissionPolicy,
    /// `(username, password)` pairs allowed to register
    pub users: Vec<(String, String)>,
    pub timers: SipTimers,
    /// How often expired registrations and dialogs are swept
    pub purge_interval: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5060)),
            server_name: "Megaphone-Proxy".to_string(),
            realm: "megaphone".to_string(),
            registrar: RegistrarConfig::default(),
            admission: AdmissionPolicy::default(),
            users: Vec::new(),
            timers: SipTimers::default(),
            purge_interval: Duration::from_secs(30),
        }
    }
}

pub struct Proxy {
    server: SipServer,
    registrar: Arc<Registrar>,
    control: Arc<CallControl>,
    errors: Option<mpsc::Receiver<SipError>>,
    purge_interval: Duration,
}

impl Proxy {
    pub async fn new(config: ProxyConfig, queue: Arc<CallQueue>) -> Self {
        let (reporter, errors) = ErrorReporter::new();

        let auth = Arc::new(DigestAuth::new(&config.realm));
        for (username, password) in &config.users {
            auth.add_user(username, password).await;
        }

        let registrar = Arc::new(Registrar::new(
            auth,
            RegistrarConfig {
                server_name: config.server_name.clone(),
                ..config.registrar
            },
            reporter.clone(),
        ));
        let control = Arc::new(CallControl::new(
            queue,
            registrar.clone(),
            config.admission,
            config.server_name.clone(),
            reporter.clone(),
            config.timers.transaction_timeout(),
        ));

        let server = SipServer::new(SipServerConfig {
            listen: config.listen,
            server_name: config.server_name.clone(),
        });
        server
            .register_handler(SipMethod::Register, registrar.clone())
            .await;
        server
            .register_handler(SipMethod::Invite, Arc::new(InviteHandler::new(control.clone())))
            .await;
        server
            .register_handler(SipMethod::Ack, Arc::new(AckHandler::new(control.clone())))
            .await;
        server
            .register_handler(SipMethod::Bye, Arc::new(ByeHandler::new(control.clone())))
            .await;
        server
            .register_handler(SipMethod::Cancel, Arc::new(CancelHandler::new(control.clone())))
            .await;
        server
            .register_handler(
                SipMethod::Options,
                Arc::new(OptionsHandler::new(config.server_name, reporter)),
            )
            .await;

        Self {
            server,
            registrar,
            control,
            errors: Some(errors),
            purge_interval: config.purge_interval,
        }
    }

    /// Start listening. Everything stops when `cancel` fires.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<SocketAddr, SipError> {
        let local_addr = self.server.start(cancel.clone()).await?;

        let registrar = self.registrar.clone();
        let control = self.control.clone();
        let interval = self.purge_interval;
        self.server.tasks().spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let registrations = registrar.purge_expired().await;
                        let dialogs = control.purge_dialogs();
                        if registrations + dialogs > 0 {
                            debug!(
                                "Purged {} registrations and {} dialogs",
                                registrations, dialogs
                            );
                        }
                    }
                }
            }
        });

        info!("SIP proxy listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Receiving end of the error slot. Only the first call gets it.
    pub fn take_errors(&mut self) -> Option<mpsc::Receiver<SipError>> {
        self.errors.take()
    }

    pub fn registrar(&self) -> &Arc<Registrar> {
        &self.registrar
    }

    pub fn queue(&self) -> &Arc<CallQueue> {
        self.control.queue()
    }

    /// Call handling state shared with the control plane
    pub fn calls(&self) -> &Arc<CallControl> {
        &self.control
    }

    /// Wait for in-flight requests after cancellation
    pub async fn drain(&self) {
        self.server.drain().await;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    pub fn stop(&mut self) {
        self.server.stop();
    }
}
