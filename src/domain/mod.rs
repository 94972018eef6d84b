//! Domain layer - call sessions and the call queue

pub mod call_queue;
pub mod session;
pub mod shared;

// Re-export commonly used types
pub use call_queue::{CallQueue, HangUp, Promotion, QueueSnapshot};
pub use session::{CallSession, CallSessionState, Session};
pub use shared::{DomainError, Result};
