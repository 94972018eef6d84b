//! SIP Registrar - per-identity challenge and registration state
//!
//! Each address-of-record moves through
//! `Unregistered -> Challenged -> Authenticated(expiry) -> Unregistered`.
//! A nonce belongs to the identity it was issued to and stays valid until a
//! newer challenge supersedes it or it ages out. With `qop=auth` every use
//! must carry a higher nonce count than the last accepted one; without qop
//! the nonce is single-use.

use super::auth::{AuthChallenge, AuthorizationHeader, DigestAuth};
use super::builder::ResponseBuilder;
use super::handler::{respond, SipHandler};
use super::message::{addr_spec, header_param, SipError, SipMethod, SipRequest, SipResponse};
use super::reporter::ErrorReporter;
use super::transport::ServerTransaction;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rsip::headers::UntypedHeader;
use rsip::Header;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Registrar settings
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    pub server_name: String,
    /// Default expiration time (seconds)
    pub default_expires: u32,
    /// Minimum expiration time (seconds)
    pub min_expires: u32,
    /// Maximum expiration time (seconds)
    pub max_expires: u32,
    /// How long an issued nonce may be answered
    pub nonce_ttl: Duration,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            server_name: "Megaphone-Proxy".to_string(),
            default_expires: 3600, // 1 hour
            min_expires: 60,       // 1 minute
            max_expires: 7200,     // 2 hours
            nonce_ttl: Duration::from_secs(300),
        }
    }
}

/// Externally visible registration state of an identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Challenged,
    Authenticated { expires_at: DateTime<Utc> },
}

/// Registration binding
#[derive(Debug, Clone)]
pub struct Binding {
    /// Contact URI
    pub contact: String,
    /// Expiration time
    pub expires_at: DateTime<Utc>,
    /// User Agent
    pub user_agent: Option<String>,
}

impl Binding {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

#[derive(Debug)]
struct IssuedChallenge {
    challenge: AuthChallenge,
    issued_at: Instant,
    /// Highest nonce count accepted so far
    last_nc: u32,
    consumed: bool,
}

impl IssuedChallenge {
    fn new(challenge: AuthChallenge) -> Self {
        Self {
            challenge,
            issued_at: Instant::now(),
            last_nc: 0,
            consumed: false,
        }
    }
}

#[derive(Debug, Default)]
struct RegistrationRecord {
    challenge: Option<IssuedChallenge>,
    binding: Option<Binding>,
}

impl RegistrationRecord {
    fn active_binding(&self) -> Option<&Binding> {
        self.binding.as_ref().filter(|b| !b.is_expired())
    }
}

/// In-memory registrar
pub struct Registrar {
    /// Map of AoR to registration record
    records: RwLock<HashMap<String, RegistrationRecord>>,
    auth: Arc<DigestAuth>,
    config: RegistrarConfig,
    reporter: ErrorReporter,
}

impl Registrar {
    pub fn new(auth: Arc<DigestAuth>, config: RegistrarConfig, reporter: ErrorReporter) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            auth,
            config,
            reporter,
        }
    }

    /// Get effective expiration time
    fn get_expires(&self, requested: Option<u32>) -> u32 {
        match requested {
            Some(0) => 0, // Unregister
            Some(expires) if expires < self.config.min_expires => self.config.min_expires,
            Some(expires) if expires > self.config.max_expires => self.config.max_expires,
            Some(expires) => expires,
            None => self.config.default_expires,
        }
    }

    /// Current state of an identity
    pub async fn state(&self, aor: &str) -> RegistrationState {
        let records = self.records.read().await;
        match records.get(aor) {
            Some(record) => match record.active_binding() {
                Some(binding) => RegistrationState::Authenticated {
                    expires_at: binding.expires_at,
                },
                None if record.challenge.is_some() => RegistrationState::Challenged,
                None => RegistrationState::Unregistered,
            },
            None => RegistrationState::Unregistered,
        }
    }

    /// Check if an identity holds an unexpired registration
    pub async fn is_registered(&self, aor: &str) -> bool {
        matches!(self.state(aor).await, RegistrationState::Authenticated { .. })
    }

    /// Get the binding for an AoR
    pub async fn get_binding(&self, aor: &str) -> Option<Binding> {
        let records = self.records.read().await;
        records.get(aor)?.active_binding().cloned()
    }

    /// Get registration count
    pub async fn get_registration_count(&self) -> usize {
        let records = self.records.read().await;
        records
            .values()
            .filter(|r| r.active_binding().is_some())
            .count()
    }

    /// Drop expired bindings and records that hold nothing usable any more
    pub async fn purge_expired(&self) -> usize {
        let nonce_ttl = self.config.nonce_ttl;
        let mut records = self.records.write().await;
        let before = records.len();

        records.retain(|aor, record| {
            if record.binding.as_ref().is_some_and(|b| b.is_expired()) {
                info!("Registration expired: {}", aor);
                record.binding = None;
            }
            if record
                .challenge
                .as_ref()
                .is_some_and(|c| c.issued_at.elapsed() > nonce_ttl)
            {
                record.challenge = None;
            }
            record.binding.is_some() || record.challenge.is_some()
        });

        let purged = before - records.len();
        if purged > 0 {
            debug!("Purged {} registration records", purged);
        }
        purged
    }

    /// Run a REGISTER through the state machine and build the response
    pub async fn process(&self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let aor = request
            .to_uri()
            .ok_or_else(|| SipError::InvalidMessage("Missing To header".to_string()))?;

        // One write lock covers lookup, verification and update
        let mut records = self.records.write().await;
        let record = records.entry(aor.clone()).or_default();

        if record.binding.as_ref().is_some_and(|b| b.is_expired()) {
            info!("Registration expired: {}", aor);
            record.binding = None;
        }

        let Some(auth_value) = request.authorization() else {
            debug!("REGISTER for {} without credentials", aor);
            return self.challenge(record, request);
        };

        let auth = match AuthorizationHeader::parse(&auth_value) {
            Ok(auth) => auth,
            Err(e) => {
                warn!("Malformed credentials for {}: {}", aor, e);
                return self.challenge(record, request);
            }
        };

        let nonce_count = match self.check_credentials(&aor, record, &auth, request).await {
            Ok(nc) => nc,
            Err(e) => {
                warn!("REGISTER for {} rejected: {}", aor, e);
                return self.challenge(record, request);
            }
        };

        if let Some(issued) = record.challenge.as_mut() {
            issued.consumed = true;
            if let Some(nc) = nonce_count {
                issued.last_nc = nc;
            }
        }

        let Some(contact) = request.contact() else {
            // Binding query
            return self.ok_with_binding(record.active_binding(), None, request);
        };

        let requested = header_param(&contact, "expires")
            .and_then(|v| v.parse().ok())
            .or_else(|| request.expires());
        let expires = self.get_expires(requested);

        if expires == 0 {
            info!("Unregistering: {}", aor);
            records.remove(&aor);
            return ResponseBuilder::ok()
                .server(&self.config.server_name)
                .header(Header::Expires("0".into()))
                .build_for_request(request);
        }

        if contact.trim() == "*" {
            return ResponseBuilder::new(400)
                .server(&self.config.server_name)
                .build_for_request(request);
        }

        let binding = Binding {
            contact: addr_spec(&contact),
            expires_at: Utc::now() + ChronoDuration::seconds(expires as i64),
            user_agent: Self::extract_user_agent(request),
        };
        info!(
            "Registered: {} -> {} (expires in {}s)",
            aor, binding.contact, expires
        );
        record.binding = Some(binding);

        self.ok_with_binding(record.active_binding(), Some(expires), request)
    }

    /// Validate credentials against the challenge on record.
    ///
    /// Returns the nonce count to commit on success.
    async fn check_credentials(
        &self,
        aor: &str,
        record: &RegistrationRecord,
        auth: &AuthorizationHeader,
        request: &SipRequest,
    ) -> Result<Option<u32>, SipError> {
        if Self::aor_user(aor) != Some(auth.username.as_str()) {
            return Err(SipError::AuthRejected(format!(
                "username {} does not match {}",
                auth.username, aor
            )));
        }

        let request_uri = request.inner.uri.to_string();
        if !auth.uri.eq_ignore_ascii_case(&request_uri) {
            return Err(SipError::AuthRejected(format!(
                "digest uri {} does not match {}",
                auth.uri, request_uri
            )));
        }

        let issued = record
            .challenge
            .as_ref()
            .ok_or_else(|| SipError::AuthRejected("no challenge on record".to_string()))?;

        if auth.nonce != issued.challenge.nonce {
            return Err(SipError::AuthRejected("stale nonce".to_string()));
        }

        if issued.issued_at.elapsed() > self.config.nonce_ttl {
            return Err(SipError::AuthRejected("nonce expired".to_string()));
        }

        let nonce_count = match &auth.qop {
            Some(_) => {
                let nc = auth
                    .nonce_count()
                    .ok_or_else(|| SipError::AuthRejected("missing nonce count".to_string()))?;
                if nc <= issued.last_nc {
                    return Err(SipError::AuthRejected("nonce count replayed".to_string()));
                }
                Some(nc)
            }
            None if issued.consumed => {
                return Err(SipError::AuthRejected("nonce already used".to_string()));
            }
            None => None,
        };

        self.auth
            .verify_response(auth, SipMethod::Register.as_str())
            .await?;

        info!("REGISTER authenticated for user: {}", auth.username);
        Ok(nonce_count)
    }

    /// Issue a fresh challenge, superseding any previous one
    fn challenge(
        &self,
        record: &mut RegistrationRecord,
        request: &SipRequest,
    ) -> Result<SipResponse, SipError> {
        let challenge = self.auth.create_challenge();
        let header_value = challenge.to_header_value();
        record.challenge = Some(IssuedChallenge::new(challenge));

        ResponseBuilder::unauthorized()
            .server(&self.config.server_name)
            .header(Header::WwwAuthenticate(header_value.into()))
            .build_for_request(request)
    }

    /// `granted` is the expiry just bound; queries report the time left
    fn ok_with_binding(
        &self,
        binding: Option<&Binding>,
        granted: Option<u32>,
        request: &SipRequest,
    ) -> Result<SipResponse, SipError> {
        let mut builder = ResponseBuilder::ok().server(&self.config.server_name);
        if let Some(binding) = binding {
            let remaining = granted.map(i64::from).unwrap_or_else(|| {
                (binding.expires_at - Utc::now()).num_seconds().max(0)
            });
            builder = builder
                .header(Header::Contact(
                    format!("<{}>;expires={}", binding.contact, remaining).into(),
                ))
                .header(Header::Expires(remaining.to_string().into()));
        }
        builder.build_for_request(request)
    }

    /// User part of a SIP URI
    fn aor_user(aor: &str) -> Option<&str> {
        let rest = aor
            .strip_prefix("sips:")
            .or_else(|| aor.strip_prefix("sip:"))
            .unwrap_or(aor);
        rest.split_once('@').map(|(user, _)| user)
    }

    /// Extract User-Agent from request
    fn extract_user_agent(request: &SipRequest) -> Option<String> {
        request.headers().iter().find_map(|h| match h {
            Header::UserAgent(ua) => Some(ua.value().to_string()),
            _ => None,
        })
    }
}

#[async_trait]
impl SipHandler for Registrar {
    async fn handle_request(
        &self,
        request: SipRequest,
        tx: &dyn ServerTransaction,
    ) -> Result<(), SipError> {
        debug!("Handling REGISTER request from {}", tx.source());
        let response = self.process(&request).await?;
        respond(tx, response, &self.reporter, SipMethod::Register).await;
        Ok(())
    }
}
