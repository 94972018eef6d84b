//! SIP Digest Authentication (RFC 2617, RFC 3261)
//!
//! Server side: issue challenges and check credential responses against
//! the configured user table. Client side: answer a challenge received
//! from an upstream registrar.

use super::message::SipError;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const DIGEST_ALGORITHM: &str = "MD5";
pub const QOP_AUTH: &str = "auth";

/// Authentication challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
}

impl AuthChallenge {
    /// Create a new authentication challenge with a fresh nonce
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            nonce: Self::generate_nonce(),
            algorithm: DIGEST_ALGORITHM.to_string(),
            qop: Some(QOP_AUTH.to_string()),
            opaque: None,
        }
    }

    fn generate_nonce() -> String {
        let random_bytes: [u8; 16] = rand::thread_rng().gen();
        hex::encode(random_bytes)
    }

    /// Parse a WWW-Authenticate / Proxy-Authenticate value
    pub fn parse(value: &str) -> Result<Self, SipError> {
        let params = parse_digest_params(value)?;
        let required = |key: &str| {
            params
                .get(key)
                .cloned()
                .ok_or_else(|| SipError::InvalidMessage(format!("Missing {} in challenge", key)))
        };

        Ok(Self {
            realm: required("realm")?,
            nonce: required("nonce")?,
            algorithm: params
                .get("algorithm")
                .cloned()
                .unwrap_or_else(|| DIGEST_ALGORITHM.to_string()),
            qop: params.get("qop").cloned(),
            opaque: params.get("opaque").cloned(),
        })
    }

    /// Whether the challenge offers `qop=auth`
    pub fn offers_auth_qop(&self) -> bool {
        self.qop
            .as_deref()
            .is_some_and(|qop| qop.split(',').any(|q| q.trim() == QOP_AUTH))
    }

    /// Format as WWW-Authenticate header value
    pub fn to_header_value(&self) -> String {
        let mut value = format!(
            r#"Digest realm="{}", nonce="{}", algorithm={}"#,
            self.realm, self.nonce, self.algorithm
        );
        if let Some(qop) = &self.qop {
            value.push_str(&format!(r#", qop="{}""#, qop));
        }
        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        value
    }
}

/// Parsed Authorization header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationHeader {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
    pub opaque: Option<String>,
}

impl AuthorizationHeader {
    /// Parse an Authorization header value
    pub fn parse(value: &str) -> Result<Self, SipError> {
        debug!("Parsing Authorization header: {}", value);

        let params = parse_digest_params(value)?;
        let required = |key: &str| {
            params.get(key).cloned().ok_or_else(|| {
                SipError::AuthRejected(format!("Missing {} in Authorization", key))
            })
        };

        Ok(Self {
            username: required("username")?,
            realm: required("realm")?,
            nonce: required("nonce")?,
            uri: required("uri")?,
            response: required("response")?,
            algorithm: params.get("algorithm").cloned(),
            qop: params.get("qop").cloned(),
            nc: params.get("nc").cloned(),
            cnonce: params.get("cnonce").cloned(),
            opaque: params.get("opaque").cloned(),
        })
    }

    /// Answer a challenge. `nc` is the nonce count for this nonce, starting at 1.
    pub fn answer(
        challenge: &AuthChallenge,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        nc: u32,
    ) -> Self {
        let (qop, nc, cnonce) = if challenge.offers_auth_qop() {
            let cnonce: [u8; 8] = rand::thread_rng().gen();
            (
                Some(QOP_AUTH.to_string()),
                Some(format!("{:08x}", nc)),
                Some(hex::encode(cnonce)),
            )
        } else {
            (None, None, None)
        };

        let response = digest_response(
            username,
            password,
            &challenge.realm,
            &challenge.nonce,
            method,
            uri,
            qop.as_deref(),
            nc.as_deref(),
            cnonce.as_deref(),
        );

        Self {
            username: username.to_string(),
            realm: challenge.realm.clone(),
            nonce: challenge.nonce.clone(),
            uri: uri.to_string(),
            response,
            algorithm: Some(challenge.algorithm.clone()),
            qop,
            nc,
            cnonce,
            opaque: challenge.opaque.clone(),
        }
    }

    /// Nonce count as a number
    pub fn nonce_count(&self) -> Option<u32> {
        self.nc
            .as_deref()
            .and_then(|nc| u32::from_str_radix(nc, 16).ok())
    }

    /// Format as Authorization header value
    pub fn to_header_value(&self) -> String {
        let mut value = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}""#,
            self.username, self.realm, self.nonce, self.uri, self.response
        );
        if let Some(algorithm) = &self.algorithm {
            value.push_str(&format!(", algorithm={}", algorithm));
        }
        if let (Some(qop), Some(nc), Some(cnonce)) = (&self.qop, &self.nc, &self.cnonce) {
            value.push_str(&format!(r#", qop={}, nc={}, cnonce="{}""#, qop, nc, cnonce));
        }
        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        value
    }
}

/// Parse Digest authentication parameters.
///
/// Commas inside quoted values (e.g. `qop="auth,auth-int"`) do not split.
fn parse_digest_params(value: &str) -> Result<HashMap<String, String>, SipError> {
    let digest_str = value.trim();
    let digest_str = match digest_str.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("digest ") => &digest_str[7..],
        _ => {
            return Err(SipError::InvalidMessage(format!(
                "Unsupported authentication scheme: {}",
                value
            )))
        }
    };

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in digest_str.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    let mut params = HashMap::new();
    for part in parts {
        if let Some((key, value)) = part.trim().split_once('=') {
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().trim_matches('"');
            params.insert(key, value.to_string());
        }
    }

    Ok(params)
}

/// Calculate a digest response
#[allow(clippy::too_many_arguments)]
pub fn digest_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    // HA1 = MD5(username:realm:password)
    let ha1 = format!(
        "{:x}",
        md5::compute(format!("{}:{}:{}", username, realm, password))
    );

    // HA2 = MD5(method:uri)
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));

    // Response = MD5(HA1:nonce:HA2) or MD5(HA1:nonce:nc:cnonce:qop:HA2)
    match qop {
        Some(qop_value) => format!(
            "{:x}",
            md5::compute(format!(
                "{}:{}:{}:{}:{}:{}",
                ha1,
                nonce,
                nc.unwrap_or("00000001"),
                cnonce.unwrap_or(""),
                qop_value,
                ha2
            ))
        ),
        None => format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2))),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Digest credential checker backed by an in-memory user table
pub struct DigestAuth {
    realm: String,
    /// username -> password
    users: Arc<RwLock<HashMap<String, String>>>,
}

impl DigestAuth {
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            users: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn add_user(&self, username: &str, password: &str) {
        self.users
            .write()
            .await
            .insert(username.to_string(), password.to_string());
        info!("Added user: {}", username);
    }

    /// Issue a challenge for this realm
    pub fn create_challenge(&self) -> AuthChallenge {
        let challenge = AuthChallenge::new(&self.realm);
        debug!("Created auth challenge with nonce: {}", challenge.nonce);
        challenge
    }

    /// Check the response hash of `auth` against the stored password.
    ///
    /// Nonce freshness is the caller's business; this only checks that the
    /// client knows the shared secret.
    pub async fn verify_response(
        &self,
        auth: &AuthorizationHeader,
        method: &str,
    ) -> Result<(), SipError> {
        if auth.realm != self.realm {
            warn!("Realm mismatch: expected {}, got {}", self.realm, auth.realm);
            return Err(SipError::AuthRejected("Realm mismatch".to_string()));
        }

        if let Some(algorithm) = &auth.algorithm {
            if !algorithm.eq_ignore_ascii_case(DIGEST_ALGORITHM) {
                return Err(SipError::AuthRejected(format!(
                    "Unsupported algorithm: {}",
                    algorithm
                )));
            }
        }

        let users = self.users.read().await;
        let password = users.get(&auth.username).ok_or_else(|| {
            warn!("Authentication failed: unknown user {}", auth.username);
            SipError::AuthRejected(format!("Unknown user: {}", auth.username))
        })?;

        let expected = digest_response(
            &auth.username,
            password,
            &auth.realm,
            &auth.nonce,
            method,
            &auth.uri,
            auth.qop.as_deref(),
            auth.nc.as_deref(),
            auth.cnonce.as_deref(),
        );

        if !constant_time_eq(expected.as_bytes(), auth.response.to_ascii_lowercase().as_bytes()) {
            warn!(
                "Authentication failed for user {}: response mismatch",
                auth.username
            );
            return Err(SipError::AuthRejected("Invalid credentials".to_string()));
        }

        Ok(())
    }
}
