//! Shared kernel - types used across the domain

pub mod error;

pub use error::{DomainError, Result};
