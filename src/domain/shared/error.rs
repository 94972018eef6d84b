//! Domain errors

use thiserror::Error;

/// Domain result type
pub type Result<T> = std::result::Result<T, DomainError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Duplicate session: {0}")]
    DuplicateSession(String),

    #[error("Call queue is full ({0} waiting)")]
    QueueFull(usize),
}
