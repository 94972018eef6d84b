//! Infrastructure layer - Technical implementations
//!
//! This layer contains the protocol implementations the gateway speaks:
//! SIP signaling and the SAP announcement decoder.

pub mod protocols;
