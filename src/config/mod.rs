//! Configuration management
//!
//! Settings are read from `<dir>/config.{yaml,toml,json,...}` when present,
//! then from `MEGAPHONE__*` environment variables. Every key has a default,
//! so an empty directory yields a working configuration.

use crate::infrastructure::protocols::sip::{
    AdmissionPolicy, Credentials, Destination, ProxyConfig, RegistrarConfig, SipTimers,
    TransportProtocol, TrunkConfig,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid address for {key}: {value}")]
    InvalidAddress { key: &'static str, value: String },

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    /// Control-plane HTTP listen address. `:8080` means all interfaces.
    pub addr: String,
    pub shutdown_timeout_secs: u64,
    pub sip: SipConfig,
    pub trunk: Option<TrunkSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Severity: -4 debug, 0 info, 4 warn, 8 error
    pub level: i32,
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub listen: String,
    pub server_name: String,
    pub realm: String,
    pub default_expires: u32,
    pub min_expires: u32,
    pub max_expires: u32,
    pub nonce_ttl_secs: u64,
    pub max_waiting: usize,
    pub admission: AdmissionPolicy,
    pub users: Vec<UserEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrunkSettings {
    pub username: String,
    pub password: String,
    pub contact_hostname: String,
    #[serde(default = "default_transport")]
    pub transport: String,
    pub proxy_addr: String,
    #[serde(default = "default_trunk_expires")]
    pub expires: u32,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
}

fn default_transport() -> String {
    "udp".to_string()
}

fn default_trunk_expires() -> u32 {
    3600
}

fn default_retry_interval() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            addr: ":8080".to_string(),
            shutdown_timeout_secs: 10,
            sip: SipConfig::default(),
            trunk: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: 0,
            file: None,
        }
    }
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5060".to_string(),
            server_name: "Megaphone-Proxy".to_string(),
            realm: "megaphone".to_string(),
            default_expires: 3600,
            min_expires: 60,
            max_expires: 7200,
            nonce_ttl_secs: 300,
            max_waiting: 64,
            admission: AdmissionPolicy::Open,
            users: Vec::new(),
        }
    }
}

impl Config {
    /// Load from `dir`, falling back to defaults for anything unset
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = dir.as_ref().join("config");
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(&file.to_string_lossy()).required(false))
            .add_source(::config::Environment::with_prefix("MEGAPHONE").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.http_addr()?;
        self.sip_listen()?;

        let sip = &self.sip;
        if sip.min_expires > sip.max_expires {
            return Err(ConfigError::InvalidValue {
                key: "sip.min_expires",
                reason: format!("{} exceeds sip.max_expires {}", sip.min_expires, sip.max_expires),
            });
        }
        if sip.max_waiting == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sip.max_waiting",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(trunk) = &self.trunk {
            trunk.destination()?;
            if trunk.retry_interval_secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "trunk.retry_interval_secs",
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }

    /// HTTP listen address with `:port` expanded to all interfaces
    pub fn http_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };
        addr.parse().map_err(|_| ConfigError::InvalidAddress {
            key: "addr",
            value: self.addr.clone(),
        })
    }

    pub fn sip_listen(&self) -> Result<SocketAddr, ConfigError> {
        self.sip
            .listen
            .parse()
            .map_err(|_| ConfigError::InvalidAddress {
                key: "sip.listen",
                value: self.sip.listen.clone(),
            })
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn proxy_config(&self) -> Result<ProxyConfig, ConfigError> {
        let sip = &self.sip;
        Ok(ProxyConfig {
            listen: self.sip_listen()?,
            server_name: sip.server_name.clone(),
            realm: sip.realm.clone(),
            registrar: RegistrarConfig {
                server_name: sip.server_name.clone(),
                default_expires: sip.default_expires,
                min_expires: sip.min_expires,
                max_expires: sip.max_expires,
                nonce_ttl: Duration::from_secs(sip.nonce_ttl_secs),
            },
            admission: sip.admission,
            users: sip
                .users
                .iter()
                .map(|u| (u.username.clone(), u.password.clone()))
                .collect(),
            timers: SipTimers::default(),
            ..ProxyConfig::default()
        })
    }
}

impl TrunkSettings {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
            contact_hostname: self.contact_hostname.clone(),
        }
    }

    pub fn destination(&self) -> Result<Destination, ConfigError> {
        let transport: TransportProtocol =
            self.transport
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    key: "trunk.transport",
                    reason: format!("unknown transport {}", self.transport),
                })?;
        if transport != TransportProtocol::Udp {
            return Err(ConfigError::InvalidValue {
                key: "trunk.transport",
                reason: format!("{} is not supported, use udp", self.transport),
            });
        }
        if self.proxy_addr.is_empty() {
            return Err(ConfigError::InvalidAddress {
                key: "trunk.proxy_addr",
                value: self.proxy_addr.clone(),
            });
        }
        Ok(Destination {
            transport,
            proxy_addr: self.proxy_addr.clone(),
        })
    }

    pub fn trunk_config(&self) -> TrunkConfig {
        TrunkConfig {
            expires: self.expires,
            retry_interval: Duration::from_secs(self.retry_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tokio_test::{assert_err, assert_ok};

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("megaphone-config-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = scratch_dir();
        let config = assert_ok!(Config::load(&dir));

        assert_eq!(config.log.level, 0);
        assert_eq!(config.http_addr().unwrap(), "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(config.sip.server_name, "Megaphone-Proxy");
        assert_eq!(config.sip.admission, AdmissionPolicy::Open);
        assert!(config.trunk.is_none());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_load_toml_file() {
        let dir = scratch_dir();
        fs::write(
            dir.join("config.toml"),
            r#"
addr = "127.0.0.1:9000"

[log]
level = -4

[sip]
listen = "127.0.0.1:5080"
admission = "registered"
max_waiting = 3
users = [{ username = "alice", password = "secret" }]

[trunk]
username = "gateway"
password = "pw"
contact_hostname = "gw.example.com"
proxy_addr = "pbx.example.com:5060"
"#,
        )
        .unwrap();

        let config = assert_ok!(Config::load(&dir));
        assert_eq!(config.log.level, -4);
        assert_eq!(config.http_addr().unwrap(), "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.sip.admission, AdmissionPolicy::Registered);
        assert_eq!(config.sip.max_waiting, 3);

        let proxy = config.proxy_config().unwrap();
        assert_eq!(proxy.listen, "127.0.0.1:5080".parse().unwrap());
        assert_eq!(proxy.users, vec![("alice".to_string(), "secret".to_string())]);
        assert_eq!(proxy.registrar.max_expires, 7200);

        let trunk = config.trunk.unwrap();
        assert_eq!(trunk.destination().unwrap().domain(), "pbx.example.com");
        assert_eq!(trunk.trunk_config().retry_interval, Duration::from_secs(30));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = scratch_dir();
        fs::write(dir.join("config.toml"), "addr = [").unwrap();

        let err = assert_err!(Config::load(&dir));
        assert!(matches!(err, ConfigError::Load(_)));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = Config {
            addr: "not-an-address".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAddress { key: "addr", .. })
        ));

        let mut config = Config::default();
        config.sip.min_expires = 9000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key: "sip.min_expires", .. })
        ));
    }
}
