//! Megaphone - a SIP signaling gateway feeding a call queue
//!
//! Local devices register and place calls through the inbound
//! registrar/proxy; admitted calls wait in a queue that serves one call at a
//! time. An optional trunk registrant keeps the gateway registered upstream.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export commonly used types
pub use domain::shared::error::DomainError;
pub use domain::shared::Result;
