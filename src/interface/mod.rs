//! Interface layer - External interfaces
//!
//! This layer handles the control-plane HTTP API and its
//! request/response formatting.

pub mod api;
